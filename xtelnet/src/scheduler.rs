//! Per-session timer/ticker tasks tied to a close signal.
//!
//! Built on `tokio::time`, already part of `huntwj-tinyfugue`'s `tokio`
//! feature set (`"time"`). The Go original's `sync.WaitGroup` is realized
//! here as a `tokio::task::JoinSet`, the idiomatic Rust equivalent for
//! joining a dynamic set of spawned tasks deterministically on close —
//! matching the concurrency model `huntwj-tinyfugue`'s `event_loop.rs` uses
//! for its own background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;

/// The session-wide close signal: a one-shot notification plus a durable
/// "has fired" flag so tasks that check *after* the fact (rather than
/// `.await`ing it) still observe closure.
#[derive(Clone)]
pub struct CloseSignal {
    notify: Arc<Notify>,
    fired: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        Self { notify: Arc::new(Notify::new()), fired: Arc::new(std::sync::atomic::AtomicBool::new(false)) }
    }

    /// Idempotent: firing twice has the same effect as firing once.
    pub fn fire(&self) {
        if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once `fire` has been called (or resolves immediately if it
    /// already has).
    pub async fn fired(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Drives the scheduled tasks for one session; tasks are tracked in a
/// [`JoinSet`] so [`Scheduler::join`] can wait for all of them
/// deterministically once the close signal has fired.
#[derive(Default)]
pub struct Scheduler {
    tasks: JoinSet<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `d`, then call `f` once — unless `close` fires first, in which
    /// case `f` is never called.
    pub fn run_after<F, Fut>(&mut self, close: CloseSignal, d: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(d) => f().await,
                _ = close.fired() => {}
            }
        });
    }

    /// Call `f` at each `d` tick until `close` fires. Missed ticks due to a
    /// slow `f` are merged: `tokio::time::interval`'s default
    /// `MissedTickBehavior::Burst` would replay every missed tick, so this
    /// explicitly sets `Delay` to guarantee at-most-one outstanding
    /// invocation, per spec.md §4.7.
    pub fn run_every<F, Fut>(&mut self, close: CloseSignal, d: Duration, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(d);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // interval()'s first tick completes immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => f().await,
                    _ = close.fired() => break,
                }
            }
        });
    }

    /// Join every scheduled task, propagating panics but not spawn errors
    /// (a cancelled task is expected once `close` has fired).
    pub async fn join(&mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }
}
