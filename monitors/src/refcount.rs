use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::sleep;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
pub const MAX_TIMEOUT: Duration = Duration::from_millis(100_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountEvent {
    Added,
    Zero,
}

#[derive(Default)]
struct State {
    timeout: Option<Duration>,
    count: u32,
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<RefcountEvent>,
}

/// A counter where every increment expires on its own after the timeout.
///
/// Used to hold something back for a while after each trigger: the count only
/// returns to zero once the last increment has expired.
pub struct RefcountTimer {
    shared: Arc<Shared>,
    timers: Mutex<JoinSet<()>>,
}

impl Default for RefcountTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RefcountTimer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                events,
            }),
            timers: Mutex::new(JoinSet::new()),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) -> bool {
        if timeout > MAX_TIMEOUT {
            warn!("Refcount is not designed for timeouts as long as {timeout:?}");
            return false;
        }
        let timeout = if timeout.is_zero() {
            warn!("Refcount timeout cannot be zero, using {DEFAULT_TIMEOUT:?}");
            DEFAULT_TIMEOUT
        } else {
            timeout
        };

        self.shared.state().timeout = Some(timeout);
        true
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.state().timeout
    }

    pub fn count(&self) -> u32 {
        self.shared.state().count
    }

    /// Adds one reference and schedules its expiry. Needs a Tokio runtime.
    pub fn increment(&self) -> bool {
        let timeout = {
            let mut state = self.shared.state();
            let Some(timeout) = state.timeout else {
                warn!("No refcount timeout has been set");
                return false;
            };
            state.count += 1;
            trace!("Refcount now: {}", state.count);
            timeout
        };
        let _ = self.shared.events.send(RefcountEvent::Added);

        let shared = Arc::downgrade(&self.shared);
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        while timers.try_join_next().is_some() {}
        timers.spawn(expire(shared, timeout));

        true
    }

    /// Drops one reference now.
    ///
    /// The expiry scheduled by the matching increment is not cancelled and still
    /// runs later, so mixing this with timed expiry can release a newer
    /// reference early.
    pub fn remove_manual(&self) -> bool {
        self.shared.decrement()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefcountEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for RefcountTimer {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !timers.is_empty() {
            debug!("Cancelling {} pending refcount expiries", timers.len());
        }
        timers.abort_all();
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decrement(&self) -> bool {
        let mut state = self.state();
        if state.count == 0 {
            warn!("No refcount to remove");
            return false;
        }

        state.count -= 1;
        if state.count == 0 {
            debug!("Refcount is zero");
            let _ = self.events.send(RefcountEvent::Zero);
        } else {
            trace!("Refcount now: {}", state.count);
        }
        true
    }
}

async fn expire(shared: Weak<Shared>, timeout: Duration) {
    sleep(timeout).await;
    if let Some(shared) = shared.upgrade() {
        shared.decrement();
    }
}
