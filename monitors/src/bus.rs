mod connector;
mod name_monitor;
mod proxy;
mod watch;

use serde::Deserialize;
use std::fmt::Display;

pub use connector::{Connector, DbusConnector};
pub use name_monitor::{BusNameMonitor, OwnerChangedSubscriber, Subscription};
pub use proxy::ManagedProxy;
pub use watch::ServiceWatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn index(self) -> usize {
        match self {
            BusKind::Session => 0,
            BusKind::System => 1,
        }
    }

    pub async fn connect(self) -> zbus::Result<zbus::Connection> {
        match self {
            BusKind::Session => zbus::Connection::session().await,
            BusKind::System => zbus::Connection::system().await,
        }
    }
}

impl Display for BusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusKind::Session => write!(f, "session"),
            BusKind::System => write!(f, "system"),
        }
    }
}

/// A `NameOwnerChanged` broadcast. An empty owner means the name has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChanged {
    pub name: String,
    pub previous_owner: String,
    pub new_owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerTransition {
    Appeared,
    Vanished,
}

impl OwnerChanged {
    pub fn new(name: &str, previous_owner: &str, new_owner: &str) -> Self {
        Self {
            name: name.to_string(),
            previous_owner: previous_owner.to_string(),
            new_owner: new_owner.to_string(),
        }
    }

    /// Only the clean edges count. A replaced owner (both sides set) is not a transition.
    pub fn transition(&self) -> Option<OwnerTransition> {
        match (self.previous_owner.is_empty(), self.new_owner.is_empty()) {
            (true, false) => Some(OwnerTransition::Appeared),
            (false, true) => Some(OwnerTransition::Vanished),
            _ => None,
        }
    }
}

/// The tuple a managed proxy is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub bus: BusKind,
    pub service: String,
    pub path: String,
    pub interface: String,
}
