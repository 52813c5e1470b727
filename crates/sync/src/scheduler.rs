use std::{future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

type PerformFuture = Pin<Box<dyn Future<Output = Option<Duration>> + Send>>;

/// A single-flight, self-rescheduling refresh driver.
///
/// Runs its `perform` closure such that no two executions ever
/// overlap: concurrent [`run`](Self::run) callers attach to the cycle
/// already in flight instead of starting another. When a cycle
/// finishes, the interval it returned arms a timer for the next one;
/// returning `None` leaves the scheduler idle until an explicit
/// trigger.
///
/// The scheduler has no error channel. `perform` reports its own
/// failures and expresses backoff through the interval it returns.
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    perform: Box<dyn Fn() -> PerformFuture + Send + Sync>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    cycle: Option<Cycle>,
    timer: Option<JoinHandle<()>>,
}

struct Cycle {
    done: watch::Receiver<bool>,
    finished: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl RefreshScheduler {
    pub fn new<F, Fut>(perform: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Duration>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                perform: Box::new(move || Box::pin(perform())),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Begin a cycle without waiting for it. A no-op if one is already
    /// in flight.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.begin().await;
        });
    }

    /// Begin a cycle, or attach to the one in flight, and wait for it
    /// to complete. Callers always observe a cycle that started at or
    /// after the moment they asked.
    pub async fn run(&self) {
        let mut done = self.inner.begin().await;
        // The sender lives in the scheduler state; it is only dropped
        // after signalling, so an error here still means "finished".
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Disarm any pending timer and abort the in-flight cycle, waking
    /// attached waiters. `perform` is not guaranteed to have run to
    /// completion.
    pub async fn cancel(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(cycle) = state.cycle.take() {
            cycle.task.abort();
            let _ = cycle.finished.send(true);
        }
    }

    /// Whether a timer is armed for a future cycle.
    pub async fn is_scheduled(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Inner {
    /// Launch a cycle if none is active, else return the active one's
    /// completion signal. Check-and-launch-or-attach is atomic under
    /// the state lock, as is finish-and-rearm on the other end, so two
    /// cycles can never overlap and a timer can never fire into a live
    /// cycle.
    async fn begin(self: &Arc<Self>) -> watch::Receiver<bool> {
        let mut state = self.state.lock().await;
        if let Some(cycle) = &state.cycle {
            return cycle.done.clone();
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let (tx, rx) = watch::channel(false);
        let finished = Arc::new(tx);
        let signal = Arc::clone(&finished);
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            // A panicked cycle must still clear itself and wake
            // waiters, or every later run() would attach to a corpse.
            // It arms no timer.
            let next = match AssertUnwindSafe((inner.perform)()).catch_unwind().await {
                Ok(next) => next,
                Err(_) => {
                    tracing::error!("Refresh cycle panicked");
                    None
                }
            };
            let mut state = inner.state.lock().await;
            state.cycle = None;
            state.timer = next.map(|delay| arm_timer(&inner, delay));
            drop(state);
            let _ = signal.send(true);
        });
        state.cycle = Some(Cycle { done: rx.clone(), finished, task });
        rx
    }
}

fn arm_timer(inner: &Arc<Inner>, delay: Duration) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // Boxed to break the type cycle between the timer task and
        // `begin`, which spawns it.
        let begin: Pin<Box<dyn Future<Output = watch::Receiver<bool>> + Send>> =
            Box::pin(inner.begin());
        let _ = begin.await;
    })
}
