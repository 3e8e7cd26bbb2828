//! The schedule engine.
//!
//! Keeps the registry of schedules per pin, launches executor tasks
//! when a schedule should be running, and stops them when it
//! shouldn't. Executors are found and reaped only through the
//! registry keys, never through direct references, so removal from
//! the registry is the sole lifetime anchor.

use crate::{cache::PinCache, store::rpc};
use pinbridge_api::{
    hal::Hal,
    store::{device_doc, server_timestamp, Store},
    types::schedule::{RunStatus, ScheduleKind, ScheduleSpec},
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

pub mod exec;
pub mod window;

/// How long the engine waits for each executor to wind down at
/// shutdown. A missed deadline orphans the task; the final hardware
/// cleanup still drives the pin low.

const STOP_DEADLINE: time::Duration = time::Duration::from_secs(5);

const STATUS_RETRY_DELAY: time::Duration = time::Duration::from_secs(1);

/// Schedule change events, as diffed by the schedule listener.

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Add { pin: u8, spec: ScheduleSpec },
    Modify { pin: u8, spec: ScheduleSpec },
    Remove { pin: u8, id: String },
}

/// Shared count of active executors per pin. The command processor
/// consults it to decide whether a command preempts a schedule.

#[derive(Clone, Default)]
pub struct ActivePins(Arc<StdMutex<HashMap<u8, usize>>>);

impl ActivePins {
    pub fn new() -> ActivePins {
        ActivePins::default()
    }

    pub fn count(&self, pin: u8) -> usize {
        *self.0.lock().unwrap().get(&pin).unwrap_or(&0)
    }

    pub(crate) fn inc(&self, pin: u8) {
        *self.0.lock().unwrap().entry(pin).or_insert(0) += 1
    }

    // Returns the count remaining on the pin.

    pub(crate) fn dec(&self, pin: u8) -> usize {
        let mut map = self.0.lock().unwrap();
        let remaining = match map.get_mut(&pin) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            }
            None => 0,
        };

        if remaining == 0 {
            map.remove(&pin);
        }
        remaining
    }
}

struct Running {
    gen: u64,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct Entry {
    spec: ScheduleSpec,
    running: Option<Running>,
    // Set when a modify stopped the executor and the post-modify
    // spec should launch once the old run reports done.
    pending_restart: bool,
    // Openness of the window at the last evaluation; the closed-to-
    // open transition is what re-arms a schedule.
    was_open: bool,
    // The schedule already ran to an outcome since its window last
    // opened. Cleared on the next window opening and on every edit.
    ran: bool,
}

/// Completion report from one executor run. Produced by the tasks the
/// engine spawns; consumed only by the engine.

pub struct Done {
    pin: u8,
    id: String,
    gen: u64,
    status: Option<RunStatus>,
}

pub struct Engine {
    hal: Arc<dyn Hal>,
    cache: Arc<PinCache>,
    store: Arc<dyn Store>,
    serial: String,
    pwm_freq: u32,
    rpc_timeout: time::Duration,
    active: ActivePins,
    registry: HashMap<(u8, String), Entry>,
    tx_done: mpsc::UnboundedSender<Done>,
    next_gen: u64,
}

impl Engine {
    pub fn new(
        hal: Arc<dyn Hal>,
        cache: Arc<PinCache>,
        store: Arc<dyn Store>,
        serial: String,
        pwm_freq: u32,
        rpc_timeout: time::Duration,
        active: ActivePins,
    ) -> (Engine, mpsc::UnboundedReceiver<Done>) {
        let (tx_done, rx_done) = mpsc::unbounded_channel();

        (
            Engine {
                hal,
                cache,
                store,
                serial,
                pwm_freq,
                rpc_timeout,
                active,
                registry: HashMap::new(),
                tx_done,
                next_gen: 0,
            },
            rx_done,
        )
    }

    /// Runs the engine until stop is signalled: consumes listener
    /// events, reaps executor completions, and re-evaluates time
    /// windows on the configured cadence.

    pub async fn run(
        mut self,
        mut rx_events: mpsc::Receiver<Event>,
        mut rx_done: mpsc::UnboundedReceiver<Done>,
        reevaluate: time::Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("starting");

        // The first tick fires immediately; that's the startup
        // evaluation that launches in-window schedules after a
        // restart.

        let mut ticker = time::interval(reevaluate);

        loop {
            #[rustfmt::skip]
            tokio::select! {
                ev = rx_events.recv() => match ev {
                    Some(ev) => self.handle_event(ev).await,
                    None => break
                },
                Some(done) = rx_done.recv() => self.handle_done(done).await,
                _ = ticker.tick() => self.reevaluate().await,
                _ = stop.changed() => break
            }
        }

        self.shutdown(&mut rx_done).await;
        info!("stopped")
    }

    async fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Add { pin, spec } => self.add(pin, spec).await,

            Event::Modify { pin, spec } => {
                info!("modify schedule {} on pin {}", &spec.id, pin);

                let key = (pin, spec.id.clone());

                if let Some(entry) = self.registry.get_mut(&key) {
                    if let Some(running) = &entry.running {
                        // Stop the old run; the new spec launches
                        // when its completion is reaped.

                        let _ = running.stop.send(true);

                        entry.spec = spec;
                        entry.pending_restart = true;
                        entry.ran = false;
                        return;
                    }
                }

                // Not running (or unknown): same as a fresh add.

                self.add(pin, spec).await
            }

            Event::Remove { pin, id } => {
                info!("remove schedule {} on pin {}", &id, pin);

                if let Some(entry) = self.registry.remove(&(pin, id)) {
                    if let Some(running) = entry.running {
                        let _ = running.stop.send(true);
                    }
                }
            }
        }
    }

    async fn add(&mut self, pin: u8, spec: ScheduleSpec) {
        info!("add schedule {} on pin {}", &spec.id, pin);

        let key = (pin, spec.id.clone());
        let was_open = window::is_open(&spec);

        self.registry.insert(
            key.clone(),
            Entry {
                spec,
                running: None,
                pending_restart: false,
                was_open,
                ran: false,
            },
        );
        self.consider_launch(&key).await
    }

    // Reaps one executor completion: fixes the override flag, records
    // the outcome on the document, and relaunches a modified
    // schedule.

    async fn handle_done(&mut self, done: Done) {
        // Last executor off the pin clears the user override.

        if self.active.dec(done.pin) == 0 {
            if let Some(entry) = self.cache.entry(done.pin) {
                let mut state = entry.lock().await;

                if state.user_override_active {
                    info!("clearing user override on pin {}", done.pin);
                    state.user_override_active = false
                }
            }
        }

        let key = (done.pin, done.id.clone());
        let mut restart = false;
        let mut current = false;

        if let Some(entry) = self.registry.get_mut(&key) {
            if entry.running.as_ref().map(|r| r.gen) == Some(done.gen) {
                entry.running = None;
                restart = std::mem::take(&mut entry.pending_restart);
                current = true;

                // A recorded outcome spends this window opening; a
                // signalled stop doesn't.

                if done.status.is_some() {
                    entry.ran = true
                }
            }
        }

        // A stale completion belongs to a replaced or removed
        // schedule; the count fix above is all it gets.

        if current {
            if let Some(status) = done.status {
                self.write_status(done.pin, &done.id, status, true).await
            }

            if restart {
                self.consider_launch(&key).await
            }
        }
    }

    // Launches the schedule if it is enabled and inside its window.

    async fn consider_launch(&mut self, key: &(u8, String)) {
        let spec = match self.registry.get(key) {
            Some(e)
                if e.running.is_none()
                    && !e.ran
                    && e.spec.enabled
                    && window::is_open(&e.spec) =>
            {
                e.spec.clone()
            }
            _ => return,
        };

        let Some(pin_entry) = self.cache.entry(key.0) else {
            warn!("schedule {} names unmanaged pin {}", &key.1, key.0);
            return;
        };

        // A fade on a non-PWM pin can never run; record the error
        // instead of launching a doomed executor.

        if matches!(spec.kind, ScheduleKind::PwmFade { .. })
            && !pin_entry.desc.pwm_capable
        {
            self.write_status(key.0, &key.1, RunStatus::Error, false).await;
            return;
        }

        let gen = self.next_gen;

        self.next_gen += 1;
        self.active.inc(key.0);

        let (tx_stop, rx_stop) = watch::channel(false);
        let ctx = exec::ExecCtx {
            hal: self.hal.clone(),
            entry: pin_entry,
            spec,
            pwm_freq: self.pwm_freq,
        };
        let tx_done = self.tx_done.clone();
        let (pin, id) = (key.0, key.1.clone());

        info!("launching schedule {} on pin {}", &id, pin);

        let join = tokio::spawn(
            async move {
                let status = exec::run(ctx, rx_stop).await;
                let _ = tx_done.send(Done {
                    pin,
                    id,
                    gen,
                    status,
                });
            }
            .instrument(info_span!("sched", pin = key.0, id = key.1.as_str())),
        );

        if let Some(entry) = self.registry.get_mut(key) {
            entry.running = Some(Running {
                gen,
                stop: tx_stop,
                join,
            })
        }
    }

    // The periodic pass: launch schedules whose window opened, stop
    // executors whose window closed.

    async fn reevaluate(&mut self) {
        let mut to_launch = Vec::new();

        for (key, entry) in self.registry.iter_mut() {
            let open_now = window::is_open(&entry.spec);

            // The closed-to-open transition re-arms the schedule.

            if open_now && !entry.was_open {
                entry.ran = false
            }
            entry.was_open = open_now;

            let should_run = entry.spec.enabled && open_now && !entry.ran;

            match (&entry.running, should_run) {
                (None, true) if !entry.pending_restart => {
                    to_launch.push(key.clone())
                }
                (Some(running), false) if !open_now => {
                    let _ = running.stop.send(true);
                }
                _ => (),
            }
        }

        for key in to_launch {
            self.consider_launch(&key).await
        }
    }

    // Writes last_status (and optionally last_run_at) for a schedule.
    // Best effort with a single retry.

    async fn write_status(
        &self,
        pin: u8,
        id: &str,
        status: RunStatus,
        with_run_at: bool,
    ) {
        let prefix = format!("gpioState.{}.schedules.{}", pin, id);
        let fields = if with_run_at {
            json!({
                format!("{}.last_status", prefix): status.as_str(),
                format!("{}.last_run_at", prefix): server_timestamp(),
            })
        } else {
            json!({
                format!("{}.last_status", prefix): status.as_str(),
            })
        };
        let path = device_doc(&self.serial);

        if rpc(self.rpc_timeout, self.store.update(&path, fields.clone()))
            .await
            .is_err()
        {
            time::sleep(STATUS_RETRY_DELAY).await;

            if let Err(e) =
                rpc(self.rpc_timeout, self.store.update(&path, fields)).await
            {
                warn!("couldn't record status for schedule {} -- {}", id, e)
            }
        }
    }

    // Signals every executor and waits for each with a deadline.

    async fn shutdown(&mut self, rx_done: &mut mpsc::UnboundedReceiver<Done>) {
        info!("stopping {} schedules", self.registry.len());

        let mut joins = Vec::new();

        for (_, entry) in self.registry.drain() {
            if let Some(running) = entry.running {
                let _ = running.stop.send(true);
                joins.push(running.join)
            }
        }

        for join in joins {
            if time::timeout(STOP_DEADLINE, join).await.is_err() {
                warn!("executor missed the stop deadline; orphaning it")
            }
        }

        // Drain completions so the override bookkeeping lands.

        while let Ok(done) = rx_done.try_recv() {
            self.handle_done(done).await
        }
    }
}
