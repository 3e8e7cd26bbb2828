#![deny(unsafe_code)]

use pinbridge_api::Result;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{error, info, info_span, warn, Instrument, Span};

mod bootstrap;
mod cache;
mod command;
mod config;
mod drive;
mod hal;
mod identity;
mod listener;
mod pins;
mod schedule;
mod store;
mod sync;

// Initializes the application: reads the configuration and sets up
// the logger. Returns `None` if the process should exit (for
// instance, `--print-config` was given).

async fn init_app() -> Option<config::Config> {
    if let Some(cfg) = config::get().await {
        // Initialize the log system. The max log level is determined
        // by the user (either through the config file or the command
        // line.)

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("Unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

// Keeps a re-enterable activity alive: a panic is logged and the
// activity restarts after a short delay. A clean exit (the activity
// observed the stop signal) ends supervision.

fn supervise<F, Fut>(
    span: Span,
    mut stop: watch::Receiver<bool>,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(
        async move {
            loop {
                match tokio::spawn(factory()).await {
                    Ok(()) => break,

                    Err(e) if e.is_panic() => {
                        error!("task panicked; restarting");

                        if *stop.borrow() {
                            break;
                        }

                        #[rustfmt::skip]
                        tokio::select! {
                            _ = time::sleep(time::Duration::from_secs(1)) => (),
                            _ = stop.changed() => break
                        }
                    }

                    Err(_) => break,
                }
            }
        }
        .instrument(span),
    )
}

// Waits for SIGINT or SIGTERM.

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("couldn't install SIGTERM handler -- {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    #[rustfmt::skip]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = term.recv() => ()
    }
}

// Runs the main body of the application: bootstraps the hardware and
// the document, starts every activity, and coordinates the shutdown.

async fn run() -> Result<()> {
    let Some(cfg) = init_app().await else {
        return Ok(());
    };

    // Construct the process-wide collaborators. Failing to build the
    // HAL or determine the identity is fatal.

    let hal = hal::open(cfg.simulate_hardware)?;
    let serial = identity::get_hardware_serial(
        cfg.hardware_serial.as_deref(),
        cfg.simulate_hardware,
    )
    .await?;
    let store = store::open().await?;
    let cache = Arc::new(cache::PinCache::new(pins::PIN_TABLE));

    bootstrap::run(&hal, &store, &serial, &cache, cfg.rpc_timeout()).await?;

    let (tx_stop, rx_stop) = watch::channel(false);
    let active = schedule::ActivePins::new();
    let seen = Arc::new(StdMutex::new(command::IdLru::default()));
    let (tx_events, rx_events) = mpsc::channel(32);
    let (tx_cmd, rx_cmd) = mpsc::channel(32);

    let mut tasks = Vec::new();

    // The schedule engine and the command processor own their
    // receive channels, so they are spawned once and watched.

    let (engine, rx_done) = schedule::Engine::new(
        hal.clone(),
        cache.clone(),
        store.clone(),
        serial.clone(),
        cfg.pwm_default_frequency_hz,
        cfg.rpc_timeout(),
        active.clone(),
    );

    tasks.push(tokio::spawn(
        engine
            .run(
                rx_events,
                rx_done,
                cfg.reevaluate_interval(),
                rx_stop.clone(),
            )
            .instrument(info_span!("engine")),
    ));

    let processor = command::Processor {
        hal: hal.clone(),
        cache: cache.clone(),
        store: store.clone(),
        serial: serial.clone(),
        pwm_freq: cfg.pwm_default_frequency_hz,
        rpc_timeout: cfg.rpc_timeout(),
        active: active.clone(),
    };

    tasks.push(tokio::spawn(
        processor
            .run(rx_cmd, rx_stop.clone())
            .instrument(info_span!("commands")),
    ));

    // The listeners and the sync loop are restartable; supervise
    // them.

    info!("starting listeners");

    {
        let (store, serial, cache, hal, stop) = (
            store.clone(),
            serial.clone(),
            cache.clone(),
            hal.clone(),
            rx_stop.clone(),
        );

        tasks.push(supervise(
            info_span!("listen", what = "state"),
            rx_stop.clone(),
            move || {
                listener::desired_state(
                    store.clone(),
                    serial.clone(),
                    cache.clone(),
                    hal.clone(),
                    stop.clone(),
                )
            },
        ));
    }

    {
        let (store, serial, seen, tx_cmd, stop) = (
            store.clone(),
            serial.clone(),
            seen.clone(),
            tx_cmd.clone(),
            rx_stop.clone(),
        );

        tasks.push(supervise(
            info_span!("listen", what = "commands"),
            rx_stop.clone(),
            move || {
                listener::commands(
                    store.clone(),
                    serial.clone(),
                    seen.clone(),
                    tx_cmd.clone(),
                    stop.clone(),
                )
            },
        ));
    }

    {
        let (store, serial, tx_events, stop) = (
            store.clone(),
            serial.clone(),
            tx_events.clone(),
            rx_stop.clone(),
        );

        tasks.push(supervise(
            info_span!("listen", what = "schedules"),
            rx_stop.clone(),
            move || {
                listener::schedules(
                    store.clone(),
                    serial.clone(),
                    tx_events.clone(),
                    stop.clone(),
                )
            },
        ));
    }

    info!("starting sync loop");

    {
        let (hal, cache, interval, stop) = (
            hal.clone(),
            cache.clone(),
            cfg.pin_read_interval(),
            rx_stop.clone(),
        );

        tasks.push(supervise(
            info_span!("sync", what = "reader"),
            rx_stop.clone(),
            move || {
                sync::reader(hal.clone(), cache.clone(), interval, stop.clone())
            },
        ));
    }

    {
        let (store, serial, cache, interval, timeout, stop) = (
            store.clone(),
            serial.clone(),
            cache.clone(),
            cfg.sync_write_interval(),
            cfg.rpc_timeout(),
            rx_stop.clone(),
        );

        tasks.push(supervise(
            info_span!("sync", what = "writer"),
            rx_stop.clone(),
            move || {
                sync::writer(
                    store.clone(),
                    serial.clone(),
                    cache.clone(),
                    interval,
                    timeout,
                    stop.clone(),
                )
            },
        ));
    }

    if cfg.heartbeat_interval() != cfg.sync_write_interval() {
        let (store, serial, interval, timeout, stop) = (
            store.clone(),
            serial.clone(),
            cfg.heartbeat_interval(),
            cfg.rpc_timeout(),
            rx_stop.clone(),
        );

        tasks.push(supervise(
            info_span!("sync", what = "heartbeat"),
            rx_stop.clone(),
            move || {
                sync::heartbeat(
                    store.clone(),
                    serial.clone(),
                    interval,
                    timeout,
                    stop.clone(),
                )
            },
        ));
    }

    info!("running");

    shutdown_signal().await;

    warn!("shutting down");

    let _ = tx_stop.send(true);

    // Engine executors get their own wind-down deadline; give the
    // whole set a generous bound before abandoning stragglers.

    let joined = time::timeout(
        time::Duration::from_secs(30),
        futures::future::join_all(tasks),
    )
    .await;

    if joined.is_err() {
        warn!("some activities missed the shutdown deadline")
    }

    // Safe state: every output low, then release the GPIO.

    for entry in cache.entries() {
        if entry.desc.is_output() {
            if let Err(e) = drive::digital(&hal, &entry, false).await {
                warn!(
                    "couldn't reset pin {} -- {}",
                    entry.desc.number, e
                )
            }
        }
    }

    hal.cleanup();

    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1)
    }
}

// Type-level assertions that the shared collaborators stay object
// safe; the daemon passes them around as trait objects everywhere.

#[cfg(test)]
mod tests {
    use pinbridge_api::{hal::Hal, store::Store};

    #[test]
    fn test_collaborators_are_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}

        assert_send_sync::<dyn Hal>();
        assert_send_sync::<dyn Store>();
    }
}
