use super::{
    BusKind, Connector, DbusConnector, OwnerChanged, OwnerChangedSubscriber, OwnerTransition,
    Subscription,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

#[derive(Default)]
struct WatchState {
    target: Option<(BusKind, String)>,
    connected: bool,
}

struct Shared<C: Connector> {
    connector: Arc<C>,
    state: Mutex<WatchState>,
    // Held across the initial owner query so events seen meanwhile apply after its reply.
    transition: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<bool>,
}

/// Tracks whether a service name has an owner, without making an endpoint.
pub struct ServiceWatch<C: Connector = DbusConnector> {
    shared: Arc<Shared<C>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ServiceWatch<DbusConnector> {
    pub fn new() -> Self {
        Self::with_connector(DbusConnector::shared())
    }
}

impl Default for ServiceWatch<DbusConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> ServiceWatch<C> {
    pub fn with_connector(connector: Arc<C>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                connector,
                state: Mutex::new(WatchState::default()),
                transition: tokio::sync::Mutex::new(()),
                changes,
            }),
            subscription: Mutex::new(None),
        }
    }

    pub async fn assign(&self, bus: BusKind, service: &str) -> bool {
        if service.is_empty() {
            warn!("Watch needs a service name");
            return false;
        }
        {
            let mut state = self.shared.state();
            if let Some((_, assigned)) = &state.target {
                warn!("Watch is already assigned to {assigned}");
                return false;
            }
            state.target = Some((bus, service.to_string()));
        }

        let monitor = self.shared.connector.monitor(bus);
        let subscriber: Weak<dyn OwnerChangedSubscriber> = Arc::downgrade(&self.shared) as _;
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(monitor.subscribe(subscriber));

        let _guard = self.shared.transition.lock().await;
        match self.shared.connector.has_owner(bus, service).await {
            Ok(true) => self.shared.set_connected(true),
            Ok(false) => trace!("{service} is not running yet"),
            Err(e) => debug!("Cannot tell whether {service} is running: {e:#}"),
        }

        true
    }

    pub fn is_connected(&self) -> bool {
        let state = self.shared.state();
        state.target.is_some() && state.connected
    }

    pub fn service_name(&self) -> Option<String> {
        let state = self.shared.state();
        if state.target.is_none() {
            warn!("Watch is not assigned");
        }
        state.target.as_ref().map(|(_, service)| service.clone())
    }

    pub fn bus_kind(&self) -> Option<BusKind> {
        let state = self.shared.state();
        if state.target.is_none() {
            warn!("Watch is not assigned");
        }
        state.target.as_ref().map(|(bus, _)| *bus)
    }

    /// Receives every connection change of the watched service.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.shared.changes.subscribe()
    }
}

impl<C: Connector> Shared<C> {
    fn state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connected(&self, connected: bool) {
        let mut state = self.state();
        if state.connected == connected {
            return;
        }
        state.connected = connected;
        if let Some((_, service)) = &state.target {
            debug!("Emitting connection-changed {connected}: {service}");
        }
        let _ = self.changes.send(connected);
    }
}

#[async_trait]
impl<C: Connector> OwnerChangedSubscriber for Shared<C> {
    async fn owner_changed(&self, bus: BusKind, event: &OwnerChanged) {
        let _guard = self.transition.lock().await;
        let matches = self
            .state()
            .target
            .as_ref()
            .is_some_and(|(watched_bus, service)| *watched_bus == bus && *service == event.name);
        if !matches {
            return;
        }

        match event.transition() {
            Some(OwnerTransition::Appeared) => self.set_connected(true),
            Some(OwnerTransition::Vanished) => self.set_connected(false),
            None => {}
        }
    }
}
