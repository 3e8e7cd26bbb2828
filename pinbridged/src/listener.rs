//! The document listener set.
//!
//! Three subscriptions: the device document for desired state, the
//! same document for schedule changes, and the `commands`
//! subcollection. Each runs as its own task, drains its own channel,
//! and resubscribes with exponential backoff when the subscription
//! ends. Snapshot handling is idempotent, so a full re-delivery after
//! reconnect has no side effects.

use crate::{
    cache::PinCache,
    command::{IdLru, DEDUP_GRACE},
    schedule,
};
use pinbridge_api::{
    hal::Hal,
    store::{device_doc, ChangeKind, DocChange, Store},
    types::schedule::ScheduleSpec,
    Error,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, info, warn};

const BACKOFF_START: time::Duration = time::Duration::from_secs(1);
const BACKOFF_CAP: time::Duration = time::Duration::from_secs(60);

// Delay before the next resubscription attempt: 1 s doubling to a
// 60 s cap.

fn backoff(attempt: u32) -> time::Duration {
    BACKOFF_CAP.min(BACKOFF_START * 2u32.pow(attempt.min(6)))
}

// Waits out the backoff delay; returns false if stop was signalled.

async fn backoff_wait(attempt: u32, stop: &mut watch::Receiver<bool>) -> bool {
    #[rustfmt::skip]
    tokio::select! {
        _ = time::sleep(backoff(attempt)) => true,
        _ = stop.changed() => false
    }
}

/// The desired-state listener. Applies `gpioState.<pin>.state`
/// changes to the hardware. `last_remote` is the change detector:
/// fields the controller itself writes back never alter `state`, so
/// schedule-driven output doesn't self-trigger.

pub async fn desired_state(
    store: Arc<dyn Store>,
    serial: String,
    cache: Arc<PinCache>,
    hal: Arc<dyn Hal>,
    mut stop: watch::Receiver<bool>,
) {
    let path = device_doc(&serial);
    let mut attempt = 0;

    info!("starting");

    while !*stop.borrow() {
        match store.watch_doc(&path).await {
            Ok(mut rx) => {
                attempt = 0;

                loop {
                    #[rustfmt::skip]
                    tokio::select! {
                        snap = rx.recv() => match snap {
                            Some(doc) =>
                                apply_desired(&doc, &cache, &hal).await,
                            None => break
                        },
                        _ = stop.changed() => return
                    }
                }

                warn!("subscription ended; resubscribing")
            }
            Err(e) => warn!("couldn't subscribe -- {}", e),
        }

        if !backoff_wait(attempt, &mut stop).await {
            return;
        }
        attempt += 1
    }
}

// Applies one device-document snapshot to the cache and hardware.
// Entries that fail validation are skipped; the rest of the snapshot
// still applies.

async fn apply_desired(doc: &Value, cache: &PinCache, hal: &Arc<dyn Hal>) {
    let Some(gpio_state) = doc.get("gpioState").and_then(Value::as_object)
    else {
        return;
    };

    for (pin_str, entry) in gpio_state {
        let Ok(pin) = pin_str.parse::<u8>() else {
            warn!("skipping bad pin key '{}'", pin_str);
            continue;
        };

        let want = match entry.get("state") {
            Some(Value::Bool(v)) => *v,
            Some(Value::Null) | None => continue,
            Some(_) => {
                warn!("skipping non-boolean state on pin {}", pin);
                continue;
            }
        };

        let Some(entry) = cache.entry(pin) else {
            continue;
        };

        let mut state = entry.lock().await;

        if state.last_remote != want {
            debug!("remote state change: pin {} -> {}", pin, want);

            state.last_remote = want;
            state.desired = want;

            // The hardware may refuse (input pin, driver fault); the
            // cache keeps the remote's wish and the sync loop will
            // report the mismatch.

            match hal.set_digital(pin, want) {
                Ok(()) => {
                    state.hardware = want;
                    state.note_drive()
                }
                Err(e) => warn!("couldn't drive pin {} -- {}", pin, e),
            }
        }
    }
}

/// The command listener. Forwards each newly-seen command document to
/// the processor exactly once; the shared id set absorbs duplicate
/// deliveries and is pruned a grace period after the document is
/// removed.

pub async fn commands(
    store: Arc<dyn Store>,
    serial: String,
    seen: Arc<StdMutex<IdLru>>,
    tx_cmd: mpsc::Sender<(String, Value)>,
    mut stop: watch::Receiver<bool>,
) {
    let path = pinbridge_api::store::commands_path(&serial);
    let mut attempt = 0;

    info!("starting");

    while !*stop.borrow() {
        match store.watch_collection(&path).await {
            Ok(mut rx) => {
                attempt = 0;

                loop {
                    #[rustfmt::skip]
                    tokio::select! {
                        change = rx.recv() => match change {
                            Some(change) => {
                                if handle_command_change(
                                    change, &seen, &tx_cmd,
                                )
                                .await
                                .is_err()
                                {
                                    // Processor gone; nothing left to
                                    // feed.
                                    return;
                                }
                            }
                            None => break
                        },
                        _ = stop.changed() => return
                    }
                }

                warn!("subscription ended; resubscribing")
            }
            Err(e) => warn!("couldn't subscribe -- {}", e),
        }

        if !backoff_wait(attempt, &mut stop).await {
            return;
        }
        attempt += 1
    }
}

async fn handle_command_change(
    change: DocChange,
    seen: &Arc<StdMutex<IdLru>>,
    tx_cmd: &mpsc::Sender<(String, Value)>,
) -> Result<(), Error> {
    match change.kind {
        ChangeKind::Added => {
            // A re-delivered id is dropped here; the processor sees
            // each command once.

            if seen.lock().unwrap().insert(&change.id) {
                tx_cmd.send((change.id, change.doc)).await?
            } else {
                debug!("ignoring duplicate command {}", &change.id)
            }
        }

        ChangeKind::Modified => (),

        ChangeKind::Removed => {
            // Keep the id long enough to absorb stragglers, then
            // allow reuse.

            let seen = seen.clone();
            let id = change.id;

            tokio::spawn(async move {
                time::sleep(DEDUP_GRACE).await;
                seen.lock().unwrap().remove(&id)
            });
        }
    }
    Ok(())
}

/// One outcome of diffing a schedule snapshot against the registry
/// view.

#[derive(Debug)]
pub enum SchedDiff {
    Event(schedule::Event),
    /// The entry exists but doesn't validate; it must never launch
    /// and its `last_status` records the problem.
    Broken { pin: u8, id: String, err: Error },
}

/// Diffs the `gpioState.*.schedules` maps of a snapshot against the
/// previously-seen raw view. Re-delivery of an identical snapshot
/// yields nothing.

pub fn diff_schedules(
    prev: &mut HashMap<(u8, String), Value>,
    doc: &Value,
) -> Vec<SchedDiff> {
    let mut out = Vec::new();
    let mut current: HashMap<(u8, String), Value> = HashMap::new();

    if let Some(gpio_state) = doc.get("gpioState").and_then(Value::as_object) {
        for (pin_str, entry) in gpio_state {
            let Ok(pin) = pin_str.parse::<u8>() else {
                continue;
            };

            let Some(schedules) =
                entry.get("schedules").and_then(Value::as_object)
            else {
                continue;
            };

            for (id, raw) in schedules {
                current.insert((pin, id.clone()), raw.clone());
            }
        }
    }

    for (key, raw) in &current {
        let known = prev.get(key);

        if known.map(|old| old == raw).unwrap_or(false) {
            continue;
        }

        match ScheduleSpec::from_doc(&key.1, raw) {
            Ok(spec) => out.push(SchedDiff::Event(if known.is_some() {
                schedule::Event::Modify { pin: key.0, spec }
            } else {
                schedule::Event::Add { pin: key.0, spec }
            })),

            Err(err) => {
                // A running executor for a now-broken schedule must
                // stop; a new broken one must never start.

                if known.is_some() {
                    out.push(SchedDiff::Event(schedule::Event::Remove {
                        pin: key.0,
                        id: key.1.clone(),
                    }))
                }

                out.push(SchedDiff::Broken {
                    pin: key.0,
                    id: key.1.clone(),
                    err,
                })
            }
        }
    }

    for key in prev.keys() {
        if !current.contains_key(key) {
            out.push(SchedDiff::Event(schedule::Event::Remove {
                pin: key.0,
                id: key.1.clone(),
            }))
        }
    }

    *prev = current;
    out
}

/// The schedule listener. Watches the device document and turns
/// snapshot deltas into engine events.

pub async fn schedules(
    store: Arc<dyn Store>,
    serial: String,
    tx_events: mpsc::Sender<schedule::Event>,
    mut stop: watch::Receiver<bool>,
) {
    let path = device_doc(&serial);
    let mut attempt = 0;
    let mut prev: HashMap<(u8, String), Value> = HashMap::new();

    info!("starting");

    while !*stop.borrow() {
        match store.watch_doc(&path).await {
            Ok(mut rx) => {
                attempt = 0;

                loop {
                    #[rustfmt::skip]
                    tokio::select! {
                        snap = rx.recv() => match snap {
                            Some(doc) => {
                                for diff in diff_schedules(&mut prev, &doc) {
                                    match diff {
                                        SchedDiff::Event(ev) => {
                                            if tx_events.send(ev).await.is_err() {
                                                return;
                                            }
                                        }
                                        SchedDiff::Broken { pin, id, err } => {
                                            warn!(
                                                "schedule {} on pin {} is invalid -- {}",
                                                &id, pin, err
                                            );

                                            let fields = serde_json::json!({
                                                format!(
                                                    "gpioState.{}.schedules.{}.last_status",
                                                    pin, id
                                                ): "error",
                                            });

                                            // Best effort; the next
                                            // snapshot re-reports if
                                            // the operator edits
                                            // again.

                                            let _ = store
                                                .update(&path, fields)
                                                .await;
                                        }
                                    }
                                }
                            }
                            None => break
                        },
                        _ = stop.changed() => return
                    }
                }

                warn!("subscription ended; resubscribing")
            }
            Err(e) => warn!("couldn't subscribe -- {}", e),
        }

        if !backoff_wait(attempt, &mut stop).await {
            return;
        }
        attempt += 1
    }
}
