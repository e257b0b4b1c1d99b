mod x11_connection;

use std::time::Duration;
use tokio::sync::broadcast;

pub use x11_connection::{X11Backend, X11Events};

/// Alarm id reserved for the "activity resumed" alarm.
pub const RESET_ALARM: u32 = 0;

/// A condition on the idle counter, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AtLeast(u64),
    Below(u64),
}

/// A trigger of the backend became true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmNotify {
    pub alarm: u32,
    pub counter_value: u64,
}

/// The display-server side of the engine.
pub trait AlarmBackend: Send {
    fn create_alarm(&mut self, trigger: Trigger) -> anyhow::Result<u32>;

    fn change_alarm(&mut self, alarm: u32, trigger: Trigger) -> anyhow::Result<()>;

    fn destroy_alarm(&mut self, alarm: u32) -> anyhow::Result<()>;

    fn idle_time(&mut self) -> anyhow::Result<u64>;
}

struct IdleAlarm {
    id: u32,
    trigger: Trigger,
    handle: Option<u32>,
}

pub struct IdleAlarmEngine<B: AlarmBackend> {
    backend: Option<B>,
    // The reset alarm always sits at index 0.
    alarms: Vec<IdleAlarm>,
    reset_pending: bool,
    last_fired: u32,
    expired: broadcast::Sender<u32>,
}

impl IdleAlarmEngine<X11Backend> {
    /// Uses the X server's IDLETIME counter, or stays inert if there is none.
    pub fn x11() -> Self {
        match X11Backend::connect() {
            Ok(backend) => {
                info!("Using the X11 IDLETIME counter for idle alarms");
                Self::new(backend)
            }
            Err(e) => {
                warn!("Idle alarms are disabled: {e:#}");
                Self::inert()
            }
        }
    }
}

impl<B: AlarmBackend> IdleAlarmEngine<B> {
    pub fn new(backend: B) -> Self {
        Self::with_backend(Some(backend))
    }

    /// An engine that accepts alarms but never fires.
    pub fn inert() -> Self {
        Self::with_backend(None)
    }

    fn with_backend(backend: Option<B>) -> Self {
        let (expired, _) = broadcast::channel(64);
        Self {
            backend,
            alarms: vec![IdleAlarm {
                id: RESET_ALARM,
                trigger: Trigger::Below(0),
                handle: None,
            }],
            reset_pending: false,
            last_fired: RESET_ALARM,
            expired,
        }
    }

    pub fn is_inert(&self) -> bool {
        self.backend.is_none()
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    /// Receives the id of every expired alarm, `RESET_ALARM` when the user is back.
    pub fn subscribe(&self) -> broadcast::Receiver<u32> {
        self.expired.subscribe()
    }

    pub fn last_fired_id(&self) -> u32 {
        self.last_fired
    }

    pub fn idle_time(&mut self) -> Option<Duration> {
        let backend = self.backend.as_mut()?;
        match backend.idle_time() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(e) => {
                warn!("Cannot read the idle time: {e:#}");
                None
            }
        }
    }

    /// Sets a new alarm or moves an existing one to a new timeout, and arms it.
    pub fn set_alarm(&mut self, id: u32, timeout: Duration) -> bool {
        if id == RESET_ALARM {
            warn!("Alarm id {RESET_ALARM} is reserved");
            return false;
        }
        if timeout.is_zero() {
            warn!("Alarm {id} cannot have a zero timeout");
            return false;
        }

        let threshold = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let index = match self.position(id) {
            Some(index) => index,
            None => {
                self.alarms.push(IdleAlarm {
                    id,
                    trigger: Trigger::AtLeast(threshold),
                    handle: None,
                });
                self.alarms.len() - 1
            }
        };
        self.alarms[index].trigger = Trigger::AtLeast(threshold);
        debug!("Alarm {id} set to {threshold}ms");

        self.arm(index)
    }

    pub fn remove_alarm(&mut self, id: u32) -> bool {
        if id == RESET_ALARM {
            warn!("The reset alarm cannot be removed");
            return false;
        }
        let Some(index) = self.position(id) else {
            warn!("No alarm {id} to remove");
            return false;
        };

        let alarm = self.alarms.remove(index);
        if let (Some(backend), Some(handle)) = (self.backend.as_mut(), alarm.handle) {
            if let Err(e) = backend.destroy_alarm(handle) {
                warn!("Failed to destroy alarm {id}: {e:#}");
            }
        }
        true
    }

    /// Feeds a notification from the display server. Returns whether it was ours.
    pub fn handle_notify(&mut self, notify: AlarmNotify) -> bool {
        let Some(index) = self
            .alarms
            .iter()
            .position(|alarm| alarm.handle == Some(notify.alarm))
        else {
            return false;
        };
        let id = self.alarms[index].id;
        self.last_fired = id;

        if id == RESET_ALARM {
            self.reset_all();
        } else {
            debug!("Alarm {id} expired at {}ms", notify.counter_value);
            let _ = self.expired.send(id);
            self.set_reset(notify.counter_value);
        }
        true
    }

    fn position(&self, id: u32) -> Option<usize> {
        self.alarms.iter().position(|alarm| alarm.id == id)
    }

    // The user is back: every countdown starts again from the new, small idle time.
    fn reset_all(&mut self) {
        debug!("Activity resumed, re-arming {} alarms", self.alarms.len() - 1);
        for index in 1..self.alarms.len() {
            self.arm(index);
        }
        let _ = self.expired.send(RESET_ALARM);
        self.reset_pending = false;
    }

    // Only the first alarm after activity arms the reset alarm.
    fn set_reset(&mut self, counter_value: u64) {
        if self.reset_pending {
            return;
        }
        // Strictly below, or it would match the value it was captured at.
        self.alarms[0].trigger = Trigger::Below(counter_value);
        self.arm(0);
        self.reset_pending = true;
    }

    fn arm(&mut self, index: usize) -> bool {
        let Some(backend) = self.backend.as_mut() else {
            return true;
        };
        let alarm = &mut self.alarms[index];
        let result = match alarm.handle {
            Some(handle) => backend.change_alarm(handle, alarm.trigger),
            None => backend
                .create_alarm(alarm.trigger)
                .map(|handle| alarm.handle = Some(handle)),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to arm alarm {}: {e:#}", alarm.id);
                false
            }
        }
    }
}

impl<B: AlarmBackend> Drop for IdleAlarmEngine<B> {
    fn drop(&mut self) {
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        for alarm in &self.alarms {
            if let Some(handle) = alarm.handle {
                if let Err(e) = backend.destroy_alarm(handle) {
                    debug!("Failed to destroy alarm {}: {e:#}", alarm.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use rstest::{fixture, rstest};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast::error::TryRecvError;

    const TICK: u64 = 100;

    struct SimAlarm {
        trigger: Trigger,
        active: bool,
    }

    /// An idle counter that only moves when the test says so.
    #[derive(Default)]
    struct Display {
        idle: u64,
        next_handle: u32,
        alarms: BTreeMap<u32, SimAlarm>,
    }

    impl Display {
        fn fired(&mut self) -> Vec<AlarmNotify> {
            let idle = self.idle;
            let mut notifications = Vec::new();
            for (handle, alarm) in &mut self.alarms {
                let met = match alarm.trigger {
                    Trigger::AtLeast(value) => idle >= value,
                    Trigger::Below(value) => idle < value,
                };
                if alarm.active && met {
                    alarm.active = false;
                    notifications.push(AlarmNotify {
                        alarm: *handle,
                        counter_value: idle,
                    });
                }
            }
            notifications
        }
    }

    #[derive(Clone, Default)]
    struct SimBackend(Arc<Mutex<Display>>);

    impl AlarmBackend for SimBackend {
        fn create_alarm(&mut self, trigger: Trigger) -> anyhow::Result<u32> {
            let mut display = self.0.lock().unwrap();
            display.next_handle += 1;
            let handle = display.next_handle;
            display.alarms.insert(handle, SimAlarm { trigger, active: true });
            Ok(handle)
        }

        fn change_alarm(&mut self, alarm: u32, trigger: Trigger) -> anyhow::Result<()> {
            let mut display = self.0.lock().unwrap();
            let alarm = display.alarms.get_mut(&alarm).ok_or(anyhow!("BadAlarm"))?;
            alarm.trigger = trigger;
            alarm.active = true;
            Ok(())
        }

        fn destroy_alarm(&mut self, alarm: u32) -> anyhow::Result<()> {
            let mut display = self.0.lock().unwrap();
            display.alarms.remove(&alarm).ok_or(anyhow!("BadAlarm"))?;
            Ok(())
        }

        fn idle_time(&mut self) -> anyhow::Result<u64> {
            Ok(self.0.lock().unwrap().idle)
        }
    }

    struct Harness {
        display: SimBackend,
        engine: IdleAlarmEngine<SimBackend>,
        expired: broadcast::Receiver<u32>,
    }

    impl Harness {
        fn deliver(&mut self) {
            let notifications = self.display.0.lock().unwrap().fired();
            for notify in notifications {
                self.engine.handle_notify(notify);
            }
        }

        /// Lets the user stay away for `ms`, delivering alarms as they go off.
        fn wait(&mut self, ms: u64) -> Vec<(u64, u32)> {
            let mut fired = Vec::new();
            let mut elapsed = 0;
            while elapsed < ms {
                self.display.0.lock().unwrap().idle += TICK;
                elapsed += TICK;
                self.deliver();
                while let Ok(id) = self.expired.try_recv() {
                    fired.push((elapsed, id));
                }
            }
            fired
        }

        fn touch(&mut self) -> Vec<u32> {
            self.display.0.lock().unwrap().idle = 0;
            self.deliver();
            let mut fired = Vec::new();
            while let Ok(id) = self.expired.try_recv() {
                fired.push(id);
            }
            fired
        }

        fn alarm_count(&self) -> usize {
            self.display.0.lock().unwrap().alarms.len()
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let display = SimBackend::default();
        let engine = IdleAlarmEngine::new(display.clone());
        let expired = engine.subscribe();
        Harness {
            display,
            engine,
            expired,
        }
    }

    #[rstest]
    fn rejects_reserved_id_and_zero_timeout(mut harness: Harness) {
        assert_eq!(RESET_ALARM, harness.engine.last_fired_id());
        assert!(!harness.engine.set_alarm(0, Duration::from_millis(100)));
        assert!(!harness.engine.set_alarm(999, Duration::ZERO));
        assert_eq!(0, harness.alarm_count());
    }

    #[rstest]
    fn fires_and_rearms_after_activity(mut harness: Harness) {
        assert!(harness.engine.set_alarm(101, Duration::from_millis(5000)));

        let fired = harness.wait(6000);
        assert_eq!(vec![(5000, 101)], fired);
        assert_eq!(101, harness.engine.last_fired_id());

        assert_eq!(vec![RESET_ALARM], harness.touch());
        assert_eq!(RESET_ALARM, harness.engine.last_fired_id());

        let fired = harness.wait(5000);
        assert_eq!(vec![(5000, 101)], fired);
    }

    #[rstest]
    fn reset_is_armed_once_per_idle_period(mut harness: Harness) {
        harness.engine.set_alarm(1, Duration::from_millis(1000));
        harness.engine.set_alarm(2, Duration::from_millis(3000));

        let fired = harness.wait(4000);
        assert_eq!(vec![(1000, 1), (3000, 2)], fired);

        assert_eq!(vec![RESET_ALARM], harness.touch());
        assert_eq!(Err(TryRecvError::Empty), harness.expired.try_recv());

        let fired = harness.wait(3000);
        assert_eq!(vec![(1000, 1), (3000, 2)], fired);
        assert_eq!(vec![RESET_ALARM], harness.touch());
    }

    #[rstest]
    fn no_reset_without_expired_alarm(mut harness: Harness) {
        harness.engine.set_alarm(1, Duration::from_millis(1000));

        harness.wait(500);
        assert!(harness.touch().is_empty());
        assert_eq!(RESET_ALARM, harness.engine.last_fired_id());
    }

    #[rstest]
    fn changing_timeout_rearms_in_place(mut harness: Harness) {
        harness.engine.set_alarm(101, Duration::from_millis(5000));
        harness.engine.set_alarm(101, Duration::from_millis(10000));
        assert_eq!(1, harness.alarm_count());

        let fired = harness.wait(11000);
        assert_eq!(vec![(10000, 101)], fired);
    }

    #[rstest]
    fn remove_and_set_again(mut harness: Harness) {
        assert!(!harness.engine.remove_alarm(202));
        assert!(!harness.engine.remove_alarm(RESET_ALARM));

        harness.engine.set_alarm(101, Duration::from_millis(2000));
        assert!(harness.engine.remove_alarm(101));
        assert_eq!(0, harness.alarm_count());
        assert!(harness.wait(3000).is_empty());

        harness.touch();
        harness.engine.set_alarm(101, Duration::from_millis(2000));
        assert_eq!(vec![(2000, 101)], harness.wait(3000));
    }

    #[rstest]
    fn unknown_notifications_are_ignored(mut harness: Harness) {
        harness.engine.set_alarm(1, Duration::from_millis(1000));

        assert!(!harness.engine.handle_notify(AlarmNotify {
            alarm: 4242,
            counter_value: 10,
        }));
        assert_eq!(Err(TryRecvError::Empty), harness.expired.try_recv());
    }

    #[rstest]
    fn reports_idle_time(mut harness: Harness) {
        harness.wait(1500);

        assert_eq!(Some(Duration::from_millis(1500)), harness.engine.idle_time());
    }

    #[rstest]
    fn drop_destroys_alarms(harness: Harness) {
        let Harness {
            display,
            mut engine,
            ..
        } = harness;
        engine.set_alarm(1, Duration::from_millis(1000));
        engine.set_alarm(2, Duration::from_millis(2000));

        drop(engine);

        assert!(display.0.lock().unwrap().alarms.is_empty());
    }

    #[rstest]
    fn inert_engine_accepts_alarms_and_stays_silent() {
        let mut engine = IdleAlarmEngine::<SimBackend>::inert();
        let mut expired = engine.subscribe();

        assert!(engine.is_inert());
        assert!(engine.set_alarm(1, Duration::from_millis(1000)));
        assert!(!engine.set_alarm(0, Duration::from_millis(1000)));
        assert!(engine.remove_alarm(1));
        assert_eq!(None, engine.idle_time());
        assert_eq!(Err(TryRecvError::Empty), expired.try_recv());
    }
}
