// src/task.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The generic worker/task queue that block I/O and cancellation are built
//! on. One [`Task`] owns one worker thread servicing a FIFO queue of
//! [`Token`]s; each buffer gets exactly one `Task`, not one per block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Uniquely identifies an enqueued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_token() -> Token {
    Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
}

/// The outcome recorded against a token once it leaves the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The worker function ran and returned this value.
    Done(i32),
    /// Removed from the queue before it ran ([`Task::cancel`]).
    Cancelled,
    /// Removed by [`Task::flush`] without running.
    Interrupted,
}

struct Item<C> {
    token: Token,
    elm: C,
    autoclear: bool,
}

enum Run {
    Running,
    Stopped,
    ShuttingDown,
}

struct Shared<C, F> {
    func: F,
    ctx_state: Mutex<CtxState<C>>,
    cv: Condvar,
    /// Per-token completion signals. A token's entry is removed once
    /// [`Task::sync`] or an autoclear completion consumes it, so that a
    /// `Sync` on one token is never woken by an unrelated completion.
    results: Mutex<std::collections::HashMap<Token, Arc<(Mutex<Option<Outcome>>, Condvar)>>>,
}

struct CtxState<C> {
    queue: VecDeque<Item<C>>,
    run: Run,
}

/// A producer/consumer task, parameterised by a worker function
/// `fn(elm) -> i32` run against successive queued items.
pub struct Task<C, F>
where
    F: Fn(&C) -> i32 + Send + Sync + 'static,
    C: Send + 'static,
{
    shared: Arc<Shared<C, F>>,
    worker: Option<JoinHandle<()>>,
    /// Inline (no-thread) mode drains the queue synchronously from
    /// `start`/`enqueue` instead of running a background thread.
    inline: bool,
    stopped: Arc<AtomicBool>,
}

impl<C, F> Task<C, F>
where
    F: Fn(&C) -> i32 + Send + Sync + 'static,
    C: Send + 'static,
{
    /// Creates a task in the `stopped` state. In threaded mode the worker
    /// thread is spawned immediately but parks until [`start`](Task::start)
    /// is called; in inline mode there is no thread at all.
    pub fn new(func: F, inline: bool) -> Self {
        let shared = Arc::new(Shared {
            func,
            ctx_state: Mutex::new(CtxState { queue: VecDeque::new(), run: Run::Stopped }),
            cv: Condvar::new(),
            results: Mutex::new(std::collections::HashMap::new()),
        });
        let stopped = Arc::new(AtomicBool::new(true));

        let worker = if inline {
            None
        }
        else {
            let shared2 = Arc::clone(&shared);
            let stopped2 = Arc::clone(&stopped);
            Some(thread::spawn(move || Self::worker_loop(shared2, stopped2)))
        };

        Task { shared, worker, inline, stopped }
    }

    fn worker_loop(shared: Arc<Shared<C, F>>, stopped: Arc<AtomicBool>) {
        loop {
            let item = {
                let mut state = shared.ctx_state.lock().unwrap();
                loop {
                    match state.run {
                        Run::ShuttingDown if state.queue.is_empty() => return,
                        Run::Running => {
                            if let Some(item) = state.queue.pop_front() {
                                break item;
                            }
                        }
                        _ => {}
                    }
                    stopped.store(matches!(state.run, Run::Stopped), Ordering::SeqCst);
                    state = shared.cv.wait(state).unwrap();
                }
            };
            stopped.store(false, Ordering::SeqCst);
            let ret = (shared.func)(&item.elm);
            Self::complete(&shared, item.token, Outcome::Done(ret), item.autoclear);
        }
    }

    fn complete(shared: &Shared<C, F>, token: Token, outcome: Outcome, autoclear: bool) {
        let signal = {
            let mut results = shared.results.lock().unwrap();
            if autoclear {
                results.remove(&token);
                None
            }
            else {
                results.get(&token).cloned()
            }
        };
        if let Some(sig) = signal {
            *sig.0.lock().unwrap() = Some(outcome);
            sig.1.notify_all();
        }
    }

    /// Transitions to `running`; the worker resumes processing. The inline
    /// variant drains the whole current queue before returning.
    pub fn start(&self) {
        {
            let mut state = self.shared.ctx_state.lock().unwrap();
            state.run = Run::Running;
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if self.inline {
            self.drain_inline();
        }
    }

    fn drain_inline(&self) {
        loop {
            let item = {
                let mut state = self.shared.ctx_state.lock().unwrap();
                if !matches!(state.run, Run::Running) {
                    break;
                }
                state.queue.pop_front()
            };
            match item {
                Some(item) => {
                    let ret = (self.shared.func)(&item.elm);
                    Self::complete(&self.shared, item.token, Outcome::Done(ret), item.autoclear);
                }
                None => break,
            }
        }
    }

    /// Transitions to `stopped` and blocks until the worker confirms
    /// idleness. Queued items remain for a subsequent `start`.
    pub fn stop(&self) {
        {
            let mut state = self.shared.ctx_state.lock().unwrap();
            state.run = Run::Stopped;
        }
        self.shared.cv.notify_all();
        if !self.inline {
            while !self.stopped.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        }
    }

    fn enqueue_inner(&self, elm: C, autoclear: bool) -> Result<Token> {
        let token = next_token();
        if !autoclear {
            let mut results = self.shared.results.lock().unwrap();
            results.insert(token, Arc::new((Mutex::new(None), Condvar::new())));
        }
        {
            let mut state = self.shared.ctx_state.lock().unwrap();
            state.queue.push_back(Item { token, elm, autoclear });
        }
        self.shared.cv.notify_all();
        if self.inline && matches!(self.shared.ctx_state.lock().unwrap().run, Run::Running) {
            self.drain_inline();
        }
        Ok(token)
    }

    /// Appends an item, returning a token to await with [`sync`](Task::sync).
    pub fn enqueue(&self, elm: C) -> Result<Token> {
        self.enqueue_inner(elm, false)
    }

    /// Like [`enqueue`](Task::enqueue), but the token's result is discarded
    /// automatically on completion; it cannot be `sync`'d or `cancel`'d.
    pub fn enqueue_autoclear(&self, elm: C) -> Result<Token> {
        self.enqueue_inner(elm, true)
    }

    /// Waits for `token` to complete, cancelling it if `timeout` elapses
    /// first. The token is always destroyed (removed from bookkeeping) on
    /// return, whatever the outcome.
    pub fn sync(&self, token: Token, timeout: Option<Duration>) -> Result<Outcome> {
        let signal = {
            let results = self.shared.results.lock().unwrap();
            results.get(&token).cloned()
        };
        let Some(signal) = signal
        else {
            // Already completed and consumed, or never existed as a
            // non-autoclear token.
            return Err(Error::NotFound("token".into()));
        };

        let (lock, cv) = &*signal;
        let mut guard = lock.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        while guard.is_none() {
            match deadline {
                None => guard = cv.wait(guard).unwrap(),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        break;
                    }
                    let (g, res) = cv.wait_timeout(guard, dl - now).unwrap();
                    guard = g;
                    if res.timed_out() && guard.is_none() {
                        break;
                    }
                }
            }
        }

        let mut timed_out = false;
        let outcome = match guard.take() {
            Some(o) => o,
            None => {
                drop(guard);
                self.cancel(token);
                timed_out = true;
                Outcome::Cancelled
            }
        };
        self.shared.results.lock().unwrap().remove(&token);
        if timed_out {
            return Err(Error::Timeout);
        }
        Ok(outcome)
    }

    /// Non-blocking, non-destructive check on `token`: if it has already
    /// completed, consumes and returns the outcome exactly like
    /// [`sync`](Task::sync) would. If it is still pending, returns `None`
    /// without cancelling it or touching any bookkeeping, so the token
    /// remains valid for a later `poll` or `sync`.
    pub fn poll(&self, token: Token) -> Option<Outcome> {
        let signal = {
            let results = self.shared.results.lock().unwrap();
            results.get(&token).cloned()
        }?;
        let (lock, _cv) = &*signal;
        let outcome = lock.lock().unwrap().take()?;
        self.shared.results.lock().unwrap().remove(&token);
        Some(outcome)
    }

    /// Removes `token` from the queue if still pending, marking it complete
    /// with [`Outcome::Cancelled`]. No-op if the item already started or
    /// finished.
    pub fn cancel(&self, token: Token) {
        let removed = {
            let mut state = self.shared.ctx_state.lock().unwrap();
            let before = state.queue.len();
            state.queue.retain(|item| item.token != token);
            before != state.queue.len()
        };
        if removed {
            Self::complete(&self.shared, token, Outcome::Cancelled, false);
        }
    }

    /// Drains the pending queue, marking every entry
    /// [`Outcome::Interrupted`].
    pub fn flush(&self) {
        let drained: Vec<Item<C>> = {
            let mut state = self.shared.ctx_state.lock().unwrap();
            state.queue.drain(..).collect()
        };
        for item in drained {
            Self::complete(&self.shared, item.token, Outcome::Interrupted, item.autoclear);
        }
    }
}

impl<C, F> Drop for Task<C, F>
where
    F: Fn(&C) -> i32 + Send + Sync + 'static,
    C: Send + 'static,
{
    fn drop(&mut self) {
        self.flush();
        if let Some(handle) = self.worker.take() {
            {
                let mut state = self.shared.ctx_state.lock().unwrap();
                state.run = Run::ShuttingDown;
            }
            self.shared.cv.notify_all();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn runs_in_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let task = Task::new(move |n: &i32| {
            seen2.lock().unwrap().push(*n);
            0
        }, false);
        task.start();
        let mut tokens = vec![];
        for n in 0..5 {
            tokens.push(task.enqueue(n).unwrap());
        }
        for t in tokens {
            task.sync(t, Some(Duration::from_secs(1))).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_before_run_yields_cancelled() {
        let counter = Arc::new(AtomicI32::new(0));
        let counter2 = Arc::clone(&counter);
        let task = Task::new(move |_: &i32| {
            counter2.fetch_add(1, Ordering::SeqCst);
            0
        }, false);
        // keep stopped so nothing runs before we cancel
        let token = task.enqueue(1).unwrap();
        task.cancel(token);
        let outcome = task.sync(token, Some(Duration::from_millis(100)));
        assert_eq!(outcome.unwrap(), Outcome::Cancelled);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn poll_is_non_destructive_until_complete() {
        let counter = Arc::new(AtomicI32::new(0));
        let counter2 = Arc::clone(&counter);
        let task = Task::new(move |n: &i32| {
            counter2.fetch_add(*n, Ordering::SeqCst);
            *n * 2
        }, false);
        // Task starts stopped, so the item is still queued, not running.
        let token = task.enqueue(21).unwrap();
        assert!(task.poll(token).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // The poll above must not have cancelled the item: starting the
        // task now runs it to completion rather than finding it gone.
        task.start();
        let outcome = task.sync(token, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(outcome, Outcome::Done(42));
    }

    #[test]
    fn flush_interrupts_pending() {
        let task: Task<i32, _> = Task::new(|_: &i32| 0, false);
        let t1 = task.enqueue(1).unwrap();
        let t2 = task.enqueue(2).unwrap();
        task.flush();
        assert_eq!(task.sync(t1, None).unwrap(), Outcome::Interrupted);
        assert_eq!(task.sync(t2, None).unwrap(), Outcome::Interrupted);
    }

    #[test]
    fn inline_mode_drains_on_start() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let task = Task::new(move |n: &i32| {
            seen2.lock().unwrap().push(*n);
            0
        }, true);
        task.enqueue(1).unwrap();
        task.enqueue(2).unwrap();
        task.start();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }
}
