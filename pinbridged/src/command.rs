//! The command processor.
//!
//! Operator commands arrive from the command listener as raw
//! documents. Each is validated, applied to the hardware inside the
//! pin's exclusive section, answered with a response document, and
//! deleted. Commands are consumed exactly once; a bounded set of
//! recently-seen ids absorbs duplicate deliveries.

use crate::{
    cache::PinCache,
    drive,
    schedule::ActivePins,
    store::rpc,
};
use pinbridge_api::{
    hal::Hal,
    store::{response_doc, server_timestamp, Store},
    types::command::{Action, Command, CommandKind},
    Error, Result,
};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, error, info, warn};

/// Recently-processed command ids are kept this long after the
/// operator's app deletes the document, so a late duplicate delivery
/// is still recognized.

pub const DEDUP_GRACE: time::Duration = time::Duration::from_secs(60);

const DEDUP_CAPACITY: usize = 256;
const WRITE_RETRIES: usize = 3;
const RETRY_DELAY: time::Duration = time::Duration::from_secs(1);

/// A bounded, insertion-ordered set of command ids.

pub struct IdLru {
    cap: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl IdLru {
    pub fn new(cap: usize) -> IdLru {
        IdLru {
            cap,
            order: VecDeque::with_capacity(cap),
            set: HashSet::with_capacity(cap),
        }
    }

    /// Records an id. Returns `false` if it was already present, in
    /// which case nothing changes.

    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }

        if self.order.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }

        self.order.push_back(String::from(id));
        self.set.insert(String::from(id));
        true
    }

    pub fn remove(&mut self, id: &str) {
        if self.set.remove(id) {
            self.order.retain(|v| v != id)
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }
}

impl Default for IdLru {
    fn default() -> Self {
        IdLru::new(DEDUP_CAPACITY)
    }
}

/// Everything the processor needs to apply commands.

pub struct Processor {
    pub hal: Arc<dyn Hal>,
    pub cache: Arc<PinCache>,
    pub store: Arc<dyn Store>,
    pub serial: String,
    pub pwm_freq: u32,
    pub rpc_timeout: time::Duration,
    pub active: ActivePins,
}

impl Processor {
    /// Consumes commands until the channel closes or stop is
    /// signalled.

    pub async fn run(
        self,
        mut rx: mpsc::Receiver<(String, Value)>,
        mut stop: watch::Receiver<bool>,
    ) {
        info!("starting");

        loop {
            #[rustfmt::skip]
            tokio::select! {
                item = rx.recv() => match item {
                    Some((id, doc)) => self.process(&id, &doc).await,
                    None => break
                },
                _ = stop.changed() => break
            }
        }

        info!("stopping")
    }

    /// Applies one command document and settles its lifecycle
    /// (response written, command deleted).

    pub async fn process(&self, id: &str, doc: &Value) {
        debug!("command {}: {}", id, doc);

        match Command::from_doc(id, doc) {
            Ok(cmd) => {
                let result = self.apply(&cmd).await;

                if let Err(ref e) = result {
                    warn!("command {} failed -- {}", id, e)
                }

                self.settle(id, Some(&cmd), result).await
            }

            // Malformed commands are answered and deleted without
            // touching hardware.

            Err(e) => {
                warn!("bad command {} -- {}", id, &e);
                self.settle(id, None, Err(e)).await
            }
        }
    }

    // Drives the hardware for a validated command. Returns the level
    // the pin was driven to.

    async fn apply(&self, cmd: &Command) -> Result<bool> {
        let entry = self
            .cache
            .entry(cmd.pin)
            .ok_or_else(|| {
                Error::Schema(format!("pin {} is not managed", cmd.pin))
            })?;

        let driven;
        let seq_after;

        {
            let mut state = entry.lock().await;

            // A command addressed to a pin with a running schedule
            // preempts it; the executor sees the flag at its next
            // safe point.

            if self.active.count(cmd.pin) > 0 {
                state.user_override_active = true;
                info!("command overrides running schedule on pin {}", cmd.pin)
            }

            match cmd.kind {
                CommandKind::PinControl => {
                    driven = cmd.action.as_bool();
                    drive::digital_locked(
                        self.hal.as_ref(),
                        &entry,
                        &mut state,
                        driven,
                    )?
                }
                CommandKind::PwmControl => {
                    let duty = match cmd.action {
                        Action::On => cmd.duty.unwrap_or(100),
                        Action::Off => 0,
                    };

                    driven = duty > 0;
                    drive::pwm_locked(
                        self.hal.as_ref(),
                        &entry,
                        &mut state,
                        duty,
                        self.pwm_freq,
                    )?
                }
            }

            seq_after = state.seq;
        }

        // Arm the auto-off timer. If anything else drives the pin
        // before it elapses, the sequence number has moved and the
        // timer does nothing.

        if let (Some(ms), Action::On) = (cmd.duration_ms, cmd.action) {
            let hal = self.hal.clone();
            let entry = entry.clone();

            tokio::spawn(async move {
                time::sleep(time::Duration::from_millis(ms)).await;

                let mut state = entry.lock().await;

                if state.seq == seq_after {
                    if let Err(e) = drive::digital_locked(
                        hal.as_ref(),
                        &entry,
                        &mut state,
                        false,
                    ) {
                        warn!(
                            "auto-off failed for pin {} -- {}",
                            entry.desc.number, e
                        )
                    }
                }
            });
        }

        // Report the observed level back to the document. Best
        // effort: one retry, then the sync loop will catch it up.

        let fields = json!({
            format!("gpioState.{}.hardware_state", cmd.pin): driven,
            format!("gpioState.{}.last_hardware_read", cmd.pin):
                server_timestamp(),
        });
        let path = pinbridge_api::store::device_doc(&self.serial);

        if rpc(self.rpc_timeout, self.store.update(&path, fields.clone()))
            .await
            .is_err()
        {
            time::sleep(RETRY_DELAY).await;

            if let Err(e) =
                rpc(self.rpc_timeout, self.store.update(&path, fields)).await
            {
                warn!("couldn't report pin {} state -- {}", cmd.pin, e)
            }
        }

        Ok(driven)
    }

    // Writes the response document and deletes the command. Both are
    // retried a few times; a command that can't be settled is logged
    // and abandoned (its id stays in the de-dup set, so re-delivery
    // is a no-op).

    async fn settle(&self, id: &str, cmd: Option<&Command>, result: Result<bool>) {
        let response = match (&result, cmd) {
            (Ok(_), Some(cmd)) => json!({
                "status": "ok",
                "message": "",
                "pin": cmd.pin,
                "action": cmd.action.as_str(),
                "completed_at": server_timestamp(),
            }),
            (Err(e), Some(cmd)) => json!({
                "status": "error",
                "message": e.to_string(),
                "pin": cmd.pin,
                "action": cmd.action.as_str(),
                "completed_at": server_timestamp(),
            }),
            (Err(e), None) => json!({
                "status": "error",
                "message": e.to_string(),
                "completed_at": server_timestamp(),
            }),
            (Ok(_), None) => unreachable!(),
        };

        let resp_path = response_doc(&self.serial, id);

        if !self
            .retried(|| self.store.set(&resp_path, response.clone(), false))
            .await
        {
            error!("abandoning response for command {}", id)
        }

        let cmd_path =
            format!("{}/{}", pinbridge_api::store::commands_path(&self.serial), id);

        if !self.retried(|| self.store.delete(&cmd_path)).await {
            error!("abandoning delete of command {}", id)
        }
    }

    async fn retried<F, Fut>(&self, op: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        for attempt in 1..=WRITE_RETRIES {
            match rpc(self.rpc_timeout, op()).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("write attempt {} failed -- {}", attempt, e);

                    if attempt < WRITE_RETRIES {
                        time::sleep(RETRY_DELAY).await
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hal::sim::SimHal, pins::PIN_TABLE};
    use pinbridge_api::store::commands_path;

    fn processor(
        hal: &Arc<SimHal>,
        store: &Arc<crate::store::MemStore>,
    ) -> Processor {
        let cache = Arc::new(PinCache::new(PIN_TABLE));

        for entry in cache.entries() {
            hal.configure(&entry.desc).unwrap()
        }

        Processor {
            hal: hal.clone(),
            cache,
            store: store.clone(),
            serial: String::from("tester"),
            pwm_freq: 1_000,
            rpc_timeout: time::Duration::from_secs(10),
            active: ActivePins::new(),
        }
    }

    async fn seed_device_doc(store: &Arc<crate::store::MemStore>) {
        store
            .set("devices/tester", json!({"gpioState": {}}), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pin_control_roundtrip() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);
        let cmd_path = format!("{}/c1", commands_path("tester"));

        store
            .set(
                &cmd_path,
                json!({"type": "pin_control", "pin": 23, "action": "on"}),
                false,
            )
            .await
            .unwrap();

        proc.process(
            "c1",
            &json!({"type": "pin_control", "pin": 23, "action": "on"}),
        )
        .await;

        // Hardware was driven and the cache tracks it.

        assert_eq!(hal.level(23), Some(true));

        let state = *proc.cache.entry(23).unwrap().lock().await;

        assert!(state.desired);
        assert!(state.hardware);

        // One response document, command document deleted.

        let resp = store
            .get("devices/tester/responses/c1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["pin"], 23);
        assert_eq!(store.get(&cmd_path).await, Ok(None));

        // The observed state was reported to the device document.

        let doc = store.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["gpioState"]["23"]["hardware_state"], json!(true));
    }

    #[tokio::test]
    async fn test_invalid_command_never_touches_hardware() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);

        hal.clear_history();
        proc.process("bad", &json!({"type": "reboot", "pin": 23})).await;

        assert!(hal.history().is_empty());

        let resp = store
            .get("devices/tester/responses/bad")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resp["status"], "error");

        // An unmanaged pin is also rejected without hardware action.

        proc.process(
            "c2",
            &json!({"type": "pin_control", "pin": 9, "action": "on"}),
        )
        .await;
        assert!(hal.history().is_empty());
    }

    #[tokio::test]
    async fn test_pwm_control() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);

        proc.process(
            "p1",
            &json!({
                "type": "pwm_control",
                "pin": 18,
                "action": "on",
                "duty": 40
            }),
        )
        .await;

        assert_eq!(hal.duty(18), Some(40));
        assert_eq!(proc.cache.entry(18).unwrap().lock().await.pwm_duty, 40);

        // Off means duty zero regardless of the duty field.

        proc.process(
            "p2",
            &json!({"type": "pwm_control", "pin": 18, "action": "off"}),
        )
        .await;
        assert_eq!(hal.duty(18), Some(0));

        // PWM on an incapable pin reports an error response.

        proc.process(
            "p3",
            &json!({"type": "pwm_control", "pin": 23, "action": "on"}),
        )
        .await;

        let resp = store
            .get("devices/tester/responses/p3")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resp["status"], "error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_off() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);

        proc.process(
            "c1",
            &json!({
                "type": "pin_control",
                "pin": 24,
                "action": "on",
                "duration_ms": 3000
            }),
        )
        .await;

        assert_eq!(hal.level(24), Some(true));

        // The timer fires after the configured delay.

        time::sleep(time::Duration::from_millis(3100)).await;
        assert_eq!(hal.level(24), Some(false));
        assert!(!proc.cache.entry(24).unwrap().lock().await.desired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_off_yields_to_later_command() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);

        proc.process(
            "c1",
            &json!({
                "type": "pin_control",
                "pin": 24,
                "action": "on",
                "duration_ms": 3000
            }),
        )
        .await;

        // A second command re-drives the pin before the timer fires.

        time::sleep(time::Duration::from_millis(1000)).await;
        proc.process(
            "c2",
            &json!({"type": "pin_control", "pin": 24, "action": "on"}),
        )
        .await;

        time::sleep(time::Duration::from_millis(5000)).await;

        // The stale timer did not drive the pin low.

        assert_eq!(hal.level(24), Some(true));
    }

    #[tokio::test]
    async fn test_override_flag_set_when_schedule_active() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);

        proc.active.inc(24);
        proc.process(
            "c1",
            &json!({"type": "pin_control", "pin": 24, "action": "off"}),
        )
        .await;

        assert!(proc.cache.entry(24).unwrap().lock().await.user_override_active);

        // No schedule running on pin 23, so no override there.

        proc.process(
            "c2",
            &json!({"type": "pin_control", "pin": 23, "action": "on"}),
        )
        .await;
        assert!(!proc.cache.entry(23).unwrap().lock().await.user_override_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_retries_transient_failures() {
        let hal = Arc::new(SimHal::new());
        let store = Arc::new(crate::store::MemStore::new());

        seed_device_doc(&store).await;

        let proc = processor(&hal, &store);

        // Fail the state report and its retry plus the first response
        // write; the retries settle the command anyway.

        store.fail_next_writes(3);
        proc.process(
            "c1",
            &json!({"type": "pin_control", "pin": 23, "action": "on"}),
        )
        .await;

        assert!(store
            .get("devices/tester/responses/c1")
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_id_lru() {
        let mut lru = IdLru::new(3);

        assert!(lru.insert("a"));
        assert!(!lru.insert("a"));
        assert!(lru.contains("a"));

        assert!(lru.insert("b"));
        assert!(lru.insert("c"));

        // Capacity 3: inserting a fourth evicts the oldest.

        assert!(lru.insert("d"));
        assert!(!lru.contains("a"));
        assert!(lru.contains("b"));

        // After eviction the id may be used again.

        assert!(lru.insert("a"));

        lru.remove("b");
        assert!(!lru.contains("b"));
        assert!(lru.insert("b"));
    }
}
