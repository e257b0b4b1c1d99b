use super::{BusKind, OwnerChanged};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, Weak,
};
use tokio::task::JoinHandle;
use zbus::fdo::DBusProxy;

// One slot per bus kind. Only weak references are kept here, so the monitor
// goes away with its last holder and the next acquire builds a fresh one.
static MONITORS: Mutex<[Weak<BusNameMonitor>; 2]> = Mutex::new([Weak::new(), Weak::new()]);

#[async_trait]
pub trait OwnerChangedSubscriber: Send + Sync {
    async fn owner_changed(&self, bus: BusKind, event: &OwnerChanged);
}

type Subscribers = Vec<(u64, Weak<dyn OwnerChangedSubscriber>)>;

pub struct BusNameMonitor {
    bus: BusKind,
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    relay: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a subscriber registered until dropped.
#[must_use]
pub struct Subscription {
    monitor: Weak<BusNameMonitor>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.unsubscribe(self.id);
        }
    }
}

impl BusNameMonitor {
    /// Returns the live monitor of this bus, creating it if needed.
    ///
    /// A bus that cannot be reached is logged and yields a monitor that never fires.
    pub fn acquire(bus: BusKind) -> Arc<Self> {
        let mut slots = MONITORS.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(monitor) = slots[bus.index()].upgrade() {
            return monitor;
        }

        debug!("Creating the {bus} bus name monitor");
        let monitor = Arc::new(Self::detached(bus));
        monitor.start_relay();
        slots[bus.index()] = Arc::downgrade(&monitor);

        monitor
    }

    /// A monitor without a bus behind it. Events only arrive through [`Self::emit`].
    pub fn detached(bus: BusKind) -> Self {
        Self {
            bus,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            relay: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> BusKind {
        self.bus
    }

    fn start_relay(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No async runtime, the {} bus name monitor will stay silent",
                self.bus
            );
            return;
        };
        let task = runtime.spawn(relay(self.bus, Arc::downgrade(self)));
        *self.relay.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn subscribe(self: &Arc<Self>, subscriber: Weak<dyn OwnerChangedSubscriber>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers().push((id, subscriber));
        trace!("Subscriber {id} added to the {} bus name monitor", self.bus);

        Subscription {
            monitor: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers().retain(|(subscriber_id, _)| *subscriber_id != id);
        trace!("Subscriber {id} removed from the {} bus name monitor", self.bus);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|(_, subscriber)| subscriber.strong_count() > 0);
        subscribers.len()
    }

    /// Delivers an ownership change to every live subscriber, in subscription order.
    pub async fn emit(&self, event: OwnerChanged) {
        debug!(
            "Name owner changed on the {} bus: {} ({:?} -> {:?})",
            self.bus, event.name, event.previous_owner, event.new_owner
        );
        let receivers: Vec<Arc<dyn OwnerChangedSubscriber>> = {
            let mut subscribers = self.subscribers();
            subscribers.retain(|(_, subscriber)| subscriber.strong_count() > 0);
            subscribers
                .iter()
                .filter_map(|(_, subscriber)| subscriber.upgrade())
                .collect()
        };

        for receiver in receivers {
            receiver.owner_changed(self.bus, &event).await;
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BusNameMonitor {
    fn drop(&mut self) {
        let relay = self
            .relay
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(relay) = relay {
            debug!("Releasing the {} bus name monitor", self.bus);
            relay.abort();
        }
    }
}

fn owner_or_empty(owner: &Option<zbus::names::UniqueName<'_>>) -> String {
    owner.as_ref().map(ToString::to_string).unwrap_or_default()
}

async fn relay(bus: BusKind, monitor: Weak<BusNameMonitor>) {
    let subscription = async {
        let connection = bus.connect().await?;
        let proxy = DBusProxy::new(&connection).await?;
        let stream = proxy.receive_name_owner_changed().await?;
        Ok::<_, zbus::Error>((connection, proxy, stream))
    }
    .await;

    let (_connection, _proxy, mut stream) = match subscription {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Cannot watch name owners on the {bus} bus: {e}");
            return;
        }
    };
    info!("Watching name owners on the {bus} bus");

    while let Some(signal) = stream.next().await {
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        match signal.args() {
            Ok(args) => {
                let event = OwnerChanged {
                    name: args.name().to_string(),
                    previous_owner: owner_or_empty(args.old_owner()),
                    new_owner: owner_or_empty(args.new_owner()),
                };
                monitor.emit(event).await;
            }
            Err(e) => debug!("Malformed NameOwnerChanged on the {bus} bus: {e}"),
        }
    }
    debug!("Name owner feed of the {bus} bus has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(BusKind, OwnerChanged)>>,
    }

    #[async_trait]
    impl OwnerChangedSubscriber for Recorder {
        async fn owner_changed(&self, bus: BusKind, event: &OwnerChanged) {
            self.events.lock().unwrap().push((bus, event.clone()));
        }
    }

    fn as_subscriber(recorder: &Arc<Recorder>) -> Weak<dyn OwnerChangedSubscriber> {
        let weak: Weak<dyn OwnerChangedSubscriber> = Arc::downgrade(recorder) as _;
        weak
    }

    #[rstest]
    #[tokio::test]
    async fn fans_out_unfiltered() {
        let monitor = Arc::new(BusNameMonitor::detached(BusKind::Session));
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let _s1 = monitor.subscribe(as_subscriber(&first));
        let _s2 = monitor.subscribe(as_subscriber(&second));

        monitor
            .emit(OwnerChanged::new("org.example.Svc", "", ":1.50"))
            .await;
        monitor
            .emit(OwnerChanged::new("org.other.Svc", ":1.7", ""))
            .await;

        for recorder in [&first, &second] {
            let events = recorder.events.lock().unwrap();
            assert_eq!(2, events.len());
            assert_eq!(BusKind::Session, events[0].0);
            assert_eq!("org.example.Svc", events[0].1.name);
            assert_eq!("org.other.Svc", events[1].1.name);
        }
    }

    #[rstest]
    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let monitor = Arc::new(BusNameMonitor::detached(BusKind::System));
        let recorder = Arc::new(Recorder::default());
        let subscription = monitor.subscribe(as_subscriber(&recorder));
        assert_eq!(1, monitor.subscriber_count());

        drop(subscription);
        assert_eq!(0, monitor.subscriber_count());

        monitor.emit(OwnerChanged::new("org.example.Svc", "", ":1.2")).await;
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let monitor = Arc::new(BusNameMonitor::detached(BusKind::Session));
        let recorder = Arc::new(Recorder::default());
        let _subscription = monitor.subscribe(as_subscriber(&recorder));

        drop(recorder);
        monitor.emit(OwnerChanged::new("org.example.Svc", "", ":1.2")).await;
        assert_eq!(0, monitor.subscriber_count());
    }

    // Without a runtime no relay is started, so no bus is touched.
    #[rstest]
    fn singleton_is_shared_and_rebuilt() {
        let first = BusNameMonitor::acquire(BusKind::System);
        let second = BusNameMonitor::acquire(BusKind::System);
        assert!(Arc::ptr_eq(&first, &second));

        let weak = Arc::downgrade(&first);
        drop(first);
        drop(second);
        assert!(weak.upgrade().is_none());

        let third = BusNameMonitor::acquire(BusKind::System);
        assert_eq!(BusKind::System, third.bus());
        assert_eq!(0, third.subscriber_count());
    }
}
