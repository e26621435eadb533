use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::Instant;

type Thunk = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct LimiterState {
    /// Latest call that arrived while a window was open.
    pending: Option<Thunk>,
    /// A driver task owns the current window.
    active: bool,
}

/// Collapses bursts of calls into at most one execution per interval.
///
/// The first call in a quiet period runs at once and opens a window. Calls
/// made while the window is open replace each other; only the latest runs
/// when the window closes, and that run opens the next window.
pub struct RateLimiter {
    interval: Duration,
    state: Arc<Mutex<LimiterState>>,
    /// Serializes thunk execution between the driver and `flush`.
    exec: Arc<tokio::sync::Mutex<()>>,
    idle: Arc<Notify>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(LimiterState::default())),
            exec: Arc::new(tokio::sync::Mutex::new(())),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Run `f` now if idle, otherwise keep it as the pending call.
    pub fn schedule<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let thunk: Thunk = Box::new(move || f().boxed());
        let mut state = lock(&self.state);
        if state.active {
            state.pending = Some(thunk);
            return;
        }
        state.active = true;
        drop(state);

        // Take the execution lock before spawning so a `flush` issued right
        // after this call waits for the first run instead of overtaking it.
        let permit = Arc::clone(&self.exec).try_lock_owned().ok();
        tokio::spawn(drive(
            thunk,
            permit,
            self.interval,
            Arc::clone(&self.state),
            Arc::clone(&self.exec),
            Arc::clone(&self.idle),
        ));
    }

    /// Run the pending call now, ignoring the window, and wait for it.
    ///
    /// With nothing pending this only waits for an in-flight call to finish.
    pub async fn flush(&self) {
        let _guard = self.exec.lock().await;
        let pending = lock(&self.state).pending.take();
        if let Some(thunk) = pending {
            thunk().await;
        }
    }

    /// Drop the pending call without running it.
    pub fn cancel(&self) {
        lock(&self.state).pending = None;
    }

    /// Drop the pending call and wait until the current window has closed.
    ///
    /// Once this returns no throttled call can land until the next
    /// `schedule`, so a manual update sent afterwards is not overwritten.
    pub async fn cancel_and_wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&self.state);
                state.pending = None;
                if !state.active {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn is_idle(&self) -> bool {
        !lock(&self.state).active
    }
}

async fn drive(
    first: Thunk,
    permit: Option<OwnedMutexGuard<()>>,
    interval: Duration,
    state: Arc<Mutex<LimiterState>>,
    exec: Arc<tokio::sync::Mutex<()>>,
    idle: Arc<Notify>,
) {
    let mut next = first;
    let mut held = permit;
    loop {
        let window_end = Instant::now() + interval;
        {
            let _guard = match held.take() {
                Some(guard) => guard,
                None => Arc::clone(&exec).lock_owned().await,
            };
            next().await;
        }
        tokio::time::sleep_until(window_end).await;

        // Pending is only taken under the execution lock, so `flush` and the
        // driver never both claim it.
        let guard = Arc::clone(&exec).lock_owned().await;
        let pending = {
            let mut state = lock(&state);
            let pending = state.pending.take();
            if pending.is_none() {
                state.active = false;
            }
            pending
        };
        match pending {
            Some(thunk) => {
                next = thunk;
                held = Some(guard);
            }
            None => {
                drop(guard);
                idle.notify_waiters();
                return;
            }
        }
    }
}

fn lock(state: &Mutex<LimiterState>) -> MutexGuard<'_, LimiterState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
