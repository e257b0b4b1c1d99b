// A proxy that survives restarts of the service it is bound to: the endpoint is
// built when the name gains an owner and dropped when it loses it.
use super::{
    Binding, BusKind, BusNameMonitor, Connector, DbusConnector, OwnerChanged,
    OwnerChangedSubscriber, OwnerTransition, Subscription,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;

const STATUS_CAPACITY: usize = 16;

struct State<E> {
    binding: Option<Binding>,
    endpoint: Option<E>,
    monitor: Option<Arc<BusNameMonitor>>,
    // Set on drop; an event handler may still hold the shared state.
    released: bool,
}

struct Shared<C: Connector> {
    connector: Arc<C>,
    state: Mutex<State<C::Endpoint>>,
    // Held across endpoint resolution so connect and disconnect never interleave.
    transition: tokio::sync::Mutex<()>,
    status: broadcast::Sender<bool>,
}

pub struct ManagedProxy<C: Connector = DbusConnector> {
    shared: Arc<Shared<C>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ManagedProxy<DbusConnector> {
    pub fn new() -> Self {
        Self::with_connector(DbusConnector::shared())
    }
}

impl Default for ManagedProxy<DbusConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> ManagedProxy<C> {
    pub fn with_connector(connector: Arc<C>) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                connector,
                state: Mutex::new(State {
                    binding: None,
                    endpoint: None,
                    monitor: None,
                    released: false,
                }),
                transition: tokio::sync::Mutex::new(()),
                status,
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Binds the proxy and tries to connect right away.
    ///
    /// Returns the endpoint if the service is running now. `None` either means
    /// the call was rejected (logged) or the service has no owner yet, in which
    /// case the proxy connects as soon as it appears.
    pub async fn assign(
        &self,
        bus: BusKind,
        service: &str,
        path: &str,
        interface: &str,
    ) -> Option<C::Endpoint> {
        if service.is_empty() || path.is_empty() || interface.is_empty() {
            warn!("Proxy needs a service, a path and an interface");
            return None;
        }

        {
            let mut state = self.shared.state();
            if let Some(binding) = &state.binding {
                warn!("Proxy is already assigned to {}", binding.service);
                return None;
            }
            state.binding = Some(Binding {
                bus,
                service: service.to_string(),
                path: path.to_string(),
                interface: interface.to_string(),
            });
        }

        let monitor = self.shared.connector.monitor(bus);
        let subscriber: Weak<dyn OwnerChangedSubscriber> = Arc::downgrade(&self.shared) as _;
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(monitor.subscribe(subscriber));
        self.shared.state().monitor = Some(monitor);

        self.shared.try_connect().await;
        self.shared.state().endpoint.clone()
    }

    pub fn endpoint(&self) -> Option<C::Endpoint> {
        self.assigned(|state| state.endpoint.clone())
    }

    pub fn service_name(&self) -> Option<String> {
        self.assigned(|state| state.binding.as_ref().map(|b| b.service.clone()))
    }

    pub fn path(&self) -> Option<String> {
        self.assigned(|state| state.binding.as_ref().map(|b| b.path.clone()))
    }

    pub fn interface_name(&self) -> Option<String> {
        self.assigned(|state| state.binding.as_ref().map(|b| b.interface.clone()))
    }

    pub fn bus_kind(&self) -> Option<BusKind> {
        self.assigned(|state| state.binding.as_ref().map(|b| b.bus))
    }

    pub fn is_connected(&self) -> bool {
        let state = self.shared.state();
        state.binding.is_some() && state.endpoint.is_some()
    }

    /// Receives `true` when an endpoint is created and `false` when it is dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.shared.status.subscribe()
    }

    fn assigned<T>(&self, read: impl FnOnce(&State<C::Endpoint>) -> Option<T>) -> Option<T> {
        let state = self.shared.state();
        if state.binding.is_none() {
            warn!("Proxy is not assigned");
            return None;
        }
        read(&state)
    }
}

impl<C: Connector> Drop for ManagedProxy<C> {
    fn drop(&mut self) {
        self.subscription
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut state = self.shared.state();
        state.released = true;
        if state.endpoint.take().is_some() {
            if let Some(binding) = &state.binding {
                debug!("Releasing the proxy of {}", binding.service);
            }
            let _ = self.shared.status.send(false);
        }
        state.monitor.take();
    }
}

impl<C: Connector> Shared<C> {
    fn state(&self) -> MutexGuard<'_, State<C::Endpoint>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn try_connect(&self) -> bool {
        let _guard = self.transition.lock().await;
        let binding = {
            let state = self.state();
            let Some(binding) = state.binding.clone() else {
                return false;
            };
            if state.released {
                return false;
            }
            if state.endpoint.is_some() {
                debug!("Already connected to {}", binding.service);
                return false;
            }
            binding
        };

        match self.connector.resolve(&binding).await {
            Ok(endpoint) => {
                let mut state = self.state();
                if state.released {
                    debug!("Proxy of {} was released while connecting", binding.service);
                    return false;
                }
                state.endpoint = Some(endpoint);
                drop(state);
                debug!("Emitting proxy-status true: {}", binding.service);
                let _ = self.status.send(true);
                true
            }
            Err(e) => {
                debug!(
                    "No proxy for {}, maybe the service is not running: {e:#}",
                    binding.service
                );
                false
            }
        }
    }

    async fn try_disconnect(&self) -> bool {
        let _guard = self.transition.lock().await;
        let mut state = self.state();
        if state.endpoint.take().is_none() {
            trace!("Already disconnected");
            return false;
        }
        if let Some(binding) = &state.binding {
            debug!("Emitting proxy-status false: {}", binding.service);
        }
        let _ = self.status.send(false);
        true
    }
}

#[async_trait]
impl<C: Connector> OwnerChangedSubscriber for Shared<C> {
    async fn owner_changed(&self, bus: BusKind, event: &OwnerChanged) {
        let matches = self
            .state()
            .binding
            .as_ref()
            .is_some_and(|binding| binding.bus == bus && binding.service == event.name);
        if !matches {
            return;
        }

        match event.transition() {
            Some(OwnerTransition::Appeared) => {
                self.try_connect().await;
            }
            Some(OwnerTransition::Vanished) => {
                self.try_disconnect().await;
            }
            None => debug!(
                "Owner of {} changed from {:?} to {:?}, keeping the current endpoint",
                event.name, event.previous_owner, event.new_owner
            ),
        }
    }
}
