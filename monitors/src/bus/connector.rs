use super::{Binding, BusKind, BusNameMonitor};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::OnceCell;
use zbus::{fdo::DBusProxy, names::BusName, Connection, Proxy};

/// Everything a binding needs from a bus: the shared owner feed and a way
/// to turn a well-known name into something callable.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Endpoint: Clone + Send + Sync + 'static;

    fn monitor(&self, bus: BusKind) -> Arc<BusNameMonitor>;

    async fn resolve(&self, binding: &Binding) -> anyhow::Result<Self::Endpoint>;

    async fn has_owner(&self, bus: BusKind, service: &str) -> anyhow::Result<bool>;
}

static SHARED: Mutex<Weak<DbusConnector>> = Mutex::new(Weak::new());

/// Connects to the real session and system buses, lazily and once per bus.
#[derive(Default)]
pub struct DbusConnector {
    session: OnceCell<Connection>,
    system: OnceCell<Connection>,
}

impl DbusConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connector every default binding uses while any of them is alive.
    pub fn shared() -> Arc<Self> {
        let mut shared = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(connector) = shared.upgrade() {
            return connector;
        }
        let connector = Arc::new(Self::new());
        *shared = Arc::downgrade(&connector);
        connector
    }

    async fn connection(&self, bus: BusKind) -> anyhow::Result<&Connection> {
        let cell = match bus {
            BusKind::Session => &self.session,
            BusKind::System => &self.system,
        };
        cell.get_or_try_init(|| bus.connect())
            .await
            .with_context(|| format!("Could not connect to the {bus} bus"))
    }
}

#[async_trait]
impl Connector for DbusConnector {
    type Endpoint = Proxy<'static>;

    fn monitor(&self, bus: BusKind) -> Arc<BusNameMonitor> {
        BusNameMonitor::acquire(bus)
    }

    // Binds to the unique name of the current owner, so a restarted
    // service needs a new endpoint.
    async fn resolve(&self, binding: &Binding) -> anyhow::Result<Proxy<'static>> {
        let connection = self.connection(binding.bus).await?;
        let name = BusName::try_from(binding.service.as_str())
            .with_context(|| format!("Invalid service name {}", binding.service))?;
        let owner = DBusProxy::new(connection)
            .await?
            .get_name_owner(name)
            .await
            .with_context(|| format!("{} has no owner", binding.service))?;

        Proxy::new(
            connection,
            owner.to_string(),
            binding.path.clone(),
            binding.interface.clone(),
        )
        .await
        .with_context(|| {
            format!(
                "Cannot create a proxy for {} at {} ({})",
                binding.service, binding.path, binding.interface
            )
        })
    }

    async fn has_owner(&self, bus: BusKind, service: &str) -> anyhow::Result<bool> {
        let connection = self.connection(bus).await?;
        let name = BusName::try_from(service)
            .with_context(|| format!("Invalid service name {service}"))?;

        DBusProxy::new(connection)
            .await?
            .name_has_owner(name)
            .await
            .map_err(std::convert::Into::into)
    }
}
