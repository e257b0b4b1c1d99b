#[macro_use]
extern crate log;

mod config;

use config::RunnerConfig;
use fern::colors::{Color, ColoredLevelConfig};
use monitors::config::Config;
use monitors::idle::{AlarmNotify, X11Backend};
use monitors::refcount::MAX_TIMEOUT;
use monitors::{
    DbusConnector, IdleAlarmEngine, ManagedProxy, RefcountEvent, RefcountTimer, ServiceWatch,
    RESET_ALARM,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

fn setup_logger(verbosity: log::LevelFilter) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::Cyan);
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ));
        })
        .level(log::LevelFilter::Error)
        .level_for("monitors", verbosity)
        .level_for("pmwatch", verbosity)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::from_cli()?;
    setup_logger(config.verbosity)?;
    info!("Using config at {}", config.config_file.display());

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(config.monitors))
}

enum Tracked {
    Proxy(ManagedProxy),
    Watch(ServiceWatch),
}

async fn run(config: Config) -> anyhow::Result<()> {
    let connector = DbusConnector::shared();
    let mut tracked = Vec::with_capacity(config.services.len());
    for service in &config.services {
        let label = format!("{} on the {} bus", service.name, service.bus);
        if let Some((path, interface)) = service.endpoint() {
            let proxy = ManagedProxy::with_connector(Arc::clone(&connector));
            tokio::spawn(report_changes(label, "Proxy status", proxy.subscribe()));
            proxy
                .assign(service.bus, &service.name, path, interface)
                .await;
            tracked.push(Tracked::Proxy(proxy));
        } else {
            let watch = ServiceWatch::with_connector(Arc::clone(&connector));
            tokio::spawn(report_changes(label, "Connection changed", watch.subscribe()));
            watch.assign(service.bus, &service.name).await;
            tracked.push(Tracked::Watch(watch));
        }
    }
    let connected = tracked
        .iter()
        .filter(|tracked| match tracked {
            Tracked::Proxy(proxy) => proxy.is_connected(),
            Tracked::Watch(watch) => watch.is_connected(),
        })
        .count();
    info!("Following {} services, {connected} running", tracked.len());

    let suppression = RefcountTimer::new();
    if !suppression.set_timeout(config.suppress_timeout) {
        anyhow::bail!(
            "Suppress timeout {:?} is longer than {MAX_TIMEOUT:?}",
            config.suppress_timeout
        );
    }
    tokio::spawn(report_suppression(suppression.subscribe()));

    let mut engine = IdleAlarmEngine::<X11Backend>::x11();
    for alarm in &config.alarms {
        if !engine.set_alarm(alarm.id, alarm.get_timeout()) {
            warn!("Skipping idle alarm {}", alarm.id);
        }
    }
    let (sender, mut notifications) = mpsc::unbounded_channel::<AlarmNotify>();
    if let Some(backend) = engine.backend() {
        // The thread ends with the X connection or once the receiver is dropped.
        let _ = backend.events().forward(sender);
    }
    let mut expired = engine.subscribe();

    loop {
        tokio::select! {
            Some(notify) = notifications.recv() => {
                engine.handle_notify(notify);
                while let Ok(id) = expired.try_recv() {
                    if id == RESET_ALARM {
                        debug!("Activity resumed");
                        suppression.increment();
                    } else if suppression.count() > 0 {
                        info!("Idle alarm {id} suppressed");
                    } else {
                        info!("Idle alarm {id} expired");
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Stopping");
                break;
            }
        }
    }

    Ok(())
}

async fn report_changes(label: String, kind: &'static str, mut changes: broadcast::Receiver<bool>) {
    loop {
        match changes.recv().await {
            Ok(connected) => info!("{kind} {connected}: {label}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {skipped} changes of {label}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn report_suppression(mut events: broadcast::Receiver<RefcountEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            RefcountEvent::Added => trace!("Idle alarms suppressed"),
            RefcountEvent::Zero => debug!("Idle alarms are no longer suppressed"),
        }
    }
}
