#[macro_use]
extern crate log;

pub mod bus;
pub mod config;
pub mod idle;
pub mod refcount;

pub use bus::{
    BusKind, BusNameMonitor, Connector, DbusConnector, ManagedProxy, OwnerChanged,
    OwnerChangedSubscriber, ServiceWatch,
};
pub use idle::{IdleAlarmEngine, RESET_ALARM};
pub use refcount::{RefcountEvent, RefcountTimer};
