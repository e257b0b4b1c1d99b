use super::{AlarmBackend, AlarmNotify, Trigger};
use anyhow::{anyhow, Context};
use std::sync::Arc;
use std::{env, thread};
use tokio::sync::mpsc::UnboundedSender;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::sync::{
    self, ChangeAlarmAux, ConnectionExt as SyncConnectionExt, CreateAlarmAux, Int64, TESTTYPE,
    VALUETYPE,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

const IDLE_COUNTER_NAME: &[u8] = b"IDLETIME";

pub struct X11Backend {
    connection: Arc<RustConnection>,
    idle_counter: sync::Counter,
}

impl X11Backend {
    pub fn connect() -> anyhow::Result<Self> {
        if env::var("DISPLAY").is_err() {
            warn!("DISPLAY is not set, setting to the default value \":0\"");
            env::set_var("DISPLAY", ":0");
        }

        let (connection, _) = x11rb::connect(None).with_context(|| "Unable to connect to X11")?;
        connection
            .extension_information(sync::X11_EXTENSION_NAME)?
            .ok_or(anyhow!("No Sync extension"))?;
        connection
            .sync_initialize(3, 1)?
            .reply()
            .with_context(|| "SyncInitialize failed")?;

        let idle_counter = connection
            .sync_list_system_counters()?
            .reply()
            .with_context(|| "SyncListSystemCounters failed")?
            .counters
            .iter()
            .find(|counter| counter.name.as_slice() == IDLE_COUNTER_NAME)
            .map(|counter| counter.counter)
            .ok_or(anyhow!("No idle counter"))?;

        Ok(Self {
            connection: Arc::new(connection),
            idle_counter,
        })
    }

    /// A handle for reading alarm notifications off the same connection.
    pub fn events(&self) -> X11Events {
        X11Events {
            connection: Arc::clone(&self.connection),
        }
    }

    fn wait_value(trigger: Trigger) -> (TESTTYPE, Int64) {
        match trigger {
            Trigger::AtLeast(value) => (TESTTYPE::POSITIVE_COMPARISON, to_int64(value)),
            // NegativeComparison matches "less or equal".
            Trigger::Below(value) => (
                TESTTYPE::NEGATIVE_COMPARISON,
                to_int64(value.saturating_sub(1)),
            ),
        }
    }
}

impl AlarmBackend for X11Backend {
    fn create_alarm(&mut self, trigger: Trigger) -> anyhow::Result<u32> {
        let (test_type, value) = Self::wait_value(trigger);
        let alarm = self.connection.generate_id()?;
        let aux = CreateAlarmAux::new()
            .counter(self.idle_counter)
            .value_type(VALUETYPE::ABSOLUTE)
            .value(value)
            .test_type(test_type)
            .delta(to_int64(0))
            .events(1);
        self.connection
            .sync_create_alarm(alarm, &aux)?
            .check()
            .with_context(|| "SyncCreateAlarm failed")?;

        Ok(alarm)
    }

    fn change_alarm(&mut self, alarm: u32, trigger: Trigger) -> anyhow::Result<()> {
        let (test_type, value) = Self::wait_value(trigger);
        let aux = ChangeAlarmAux::new()
            .counter(self.idle_counter)
            .value_type(VALUETYPE::ABSOLUTE)
            .value(value)
            .test_type(test_type)
            .delta(to_int64(0))
            .events(1);
        self.connection
            .sync_change_alarm(alarm, &aux)?
            .check()
            .with_context(|| format!("SyncChangeAlarm[{alarm}] failed"))
    }

    fn destroy_alarm(&mut self, alarm: u32) -> anyhow::Result<()> {
        self.connection
            .sync_destroy_alarm(alarm)?
            .check()
            .with_context(|| format!("SyncDestroyAlarm[{alarm}] failed"))
    }

    fn idle_time(&mut self) -> anyhow::Result<u64> {
        let reply = self
            .connection
            .sync_query_counter(self.idle_counter)?
            .reply()
            .with_context(|| "SyncQueryCounter failed")?;

        Ok(from_int64(reply.counter_value))
    }
}

/// Reads the X event stream and forwards SYNC alarm notifications.
pub struct X11Events {
    connection: Arc<RustConnection>,
}

impl X11Events {
    /// The event filter: picks out alarm notifications, lets everything else through.
    pub fn alarm_notify(event: &Event) -> Option<AlarmNotify> {
        match event {
            Event::SyncAlarmNotify(notify) => Some(AlarmNotify {
                alarm: notify.alarm,
                counter_value: from_int64(notify.counter_value),
            }),
            _ => None,
        }
    }

    /// Forwards notifications from a dedicated thread until the connection or the receiver goes away.
    pub fn forward(self, sender: UnboundedSender<AlarmNotify>) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            match self.connection.wait_for_event() {
                Ok(event) => {
                    if let Some(notify) = Self::alarm_notify(&event) {
                        if sender.send(notify).is_err() {
                            debug!("Alarm receiver is gone, stopping X11 events");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("X11 connection failed: {e}");
                    return;
                }
            }
        })
    }
}

fn to_int64(value: u64) -> Int64 {
    let value = i64::try_from(value).unwrap_or(i64::MAX);
    Int64 {
        hi: (value >> 32) as i32,
        lo: value as u32,
    }
}

// The idle counter never goes negative.
fn from_int64(value: Int64) -> u64 {
    let value = (i64::from(value.hi) << 32) | i64::from(value.lo);
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(5000)]
    #[case(u64::from(u32::MAX) + 7)]
    fn counter_values_survive_the_wire(#[case] value: u64) {
        assert_eq!(value, from_int64(to_int64(value)));
    }

    #[rstest]
    fn below_is_strict() {
        let (test_type, value) = X11Backend::wait_value(Trigger::Below(5000));
        assert_eq!(TESTTYPE::NEGATIVE_COMPARISON, test_type);
        assert_eq!(4999, from_int64(value));

        let (test_type, value) = X11Backend::wait_value(Trigger::AtLeast(5000));
        assert_eq!(TESTTYPE::POSITIVE_COMPARISON, test_type);
        assert_eq!(5000, from_int64(value));
    }

    #[rstest]
    fn negative_counter_reads_as_zero() {
        assert_eq!(0, from_int64(Int64 { hi: -1, lo: 0 }));
    }
}
