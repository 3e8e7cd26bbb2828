//! Bootstrap.
//!
//! Brings the process from nothing to "running": claims and zeroes
//! the hardware, re-applies any desired state already persisted in
//! the device document, and writes the document skeleton -- merging,
//! never clobbering fields the operator owns.

use crate::{cache::PinCache, pins, store::rpc};
use pinbridge_api::{
    hal::Hal,
    store::{device_doc, server_timestamp, Store},
    Error, Result,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time;
use tracing::{info, warn};

/// Runs the bootstrap sequence. The HAL must already be constructed;
/// a hardware failure here is fatal and bubbles to the caller.

pub async fn run(
    hal: &Arc<dyn Hal>,
    store: &Arc<dyn Store>,
    serial: &str,
    cache: &Arc<PinCache>,
    rpc_timeout: time::Duration,
) -> Result<()> {
    info!("configuring {} pins", cache.entries().len());

    // Claim every pin and drive outputs to their safe state. The
    // cache starts all-false, so it already agrees.

    for entry in cache.entries() {
        hal.configure(&entry.desc)?;

        if entry.desc.is_output() {
            hal.set_digital(entry.desc.number, false)?
        }
    }

    // Pick up desired state persisted before the restart. A store
    // that can't be reached right now is a transient condition: start
    // from the safe state and let the listeners catch up.

    let doc = match rpc(rpc_timeout, store.get(&device_doc(serial))).await {
        Ok(doc) => doc.unwrap_or_else(|| json!({})),
        Err(e) => {
            warn!("couldn't fetch device document -- {}", e);
            json!({})
        }
    };

    apply_persisted_state(hal, cache, &doc).await;

    // Write the skeleton: identity, liveness, and the controller's
    // descriptive fields for every pin, with the naming rules
    // applied. Merge semantics keep operator fields intact.

    let skeleton = build_skeleton(serial, cache, &doc).await;

    if let Err(e) =
        rpc(rpc_timeout, store.set(&device_doc(serial), skeleton, true)).await
    {
        warn!("couldn't write document skeleton -- {}", e)
    }

    info!("bootstrap complete");
    Ok(())
}

// Replays `gpioState.<pin>.state` from the stored document so the
// process comes up respecting what the operator last asked for.

async fn apply_persisted_state(
    hal: &Arc<dyn Hal>,
    cache: &PinCache,
    doc: &Value,
) {
    let Some(gpio_state) = doc.get("gpioState").and_then(Value::as_object)
    else {
        return;
    };

    for (pin_str, fields) in gpio_state {
        let Ok(pin) = pin_str.parse::<u8>() else {
            continue;
        };
        let Some(want) = fields.get("state").and_then(Value::as_bool) else {
            continue;
        };
        let Some(entry) = cache.entry(pin) else {
            continue;
        };

        let mut state = entry.lock().await;

        state.desired = want;
        state.last_remote = want;

        if entry.desc.is_output() && want {
            match hal.set_digital(pin, true) {
                Ok(()) => {
                    state.hardware = true;
                    state.note_drive()
                }
                Err(e) => warn!("couldn't restore pin {} -- {}", pin, e),
            }
        }
    }
}

// Builds the merge payload for the device document: top-level
// identity plus one entry per managed pin.

async fn build_skeleton(
    serial: &str,
    cache: &PinCache,
    existing: &Value,
) -> Value {
    let mut gpio_state = Map::new();

    for entry in cache.entries() {
        let desc = &entry.desc;
        let current = existing
            .get("gpioState")
            .and_then(|g| g.get(desc.number.to_string()));
        let state = *entry.lock().await;
        let mut fields = Map::new();

        let default = desc.default_name();

        fields.insert("default_name".into(), json!(default));
        fields.insert("type".into(), json!(desc.device_type()));
        fields.insert("subtype".into(), json!(desc.subtype));
        fields.insert(
            "mode".into(),
            json!(match desc.is_output() {
                true => "output",
                false => "input",
            }),
        );
        fields.insert("pwm_capable".into(), json!(desc.pwm_capable));
        fields.insert("hardware_state".into(), json!(state.hardware));
        fields
            .insert("mismatch".into(), json!(state.desired != state.hardware));
        fields.insert("last_hardware_read".into(), server_timestamp());

        if let Some(name) = pick_name(desc, current, &default) {
            fields.insert("name".into(), json!(name));

            if current.is_none() {
                fields.insert("name_customized".into(), json!(false));
            }
        }

        gpio_state.insert(desc.number.to_string(), Value::Object(fields));
    }

    json!({
        "hardware_serial": serial,
        "status": "online",
        "last_heartbeat": server_timestamp(),
        "gpioState": Value::Object(gpio_state),
    })
}

// The naming rules. Returns the name to write, or `None` to leave
// the stored name untouched.

fn pick_name(
    desc: &pinbridge_api::types::pin::PinDescriptor,
    current: Option<&Value>,
    default: &str,
) -> Option<String> {
    let Some(current) = current else {
        // Fresh pin entry: it gets the smart default.

        return Some(String::from(default));
    };

    // A customized name belongs to the user, always.

    if current
        .get("name_customized")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }

    match current.get("name").and_then(Value::as_str) {
        // Defaults from older conventions migrate to the new one.
        Some(name) if pins::is_legacy_default(desc, name) => {
            Some(String::from(default))
        }

        // Anything else the operator may care about stays put.
        Some(_) => None,

        None => Some(String::from(default)),
    }
}

/// Marks a pin's name as operator-chosen. Writing the name it already
/// has is a no-op on the document.

pub async fn rename_pin(
    store: &Arc<dyn Store>,
    serial: &str,
    pin: u8,
    name: &str,
) -> Result<()> {
    pins::lookup(pin).ok_or(Error::NotFound)?;

    let path = device_doc(serial);

    if let Some(doc) = store.get(&path).await? {
        let current = doc
            .get("gpioState")
            .and_then(|g| g.get(pin.to_string()))
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str);

        if current == Some(name) {
            return Ok(());
        }
    }

    store
        .update(
            &path,
            json!({
                format!("gpioState.{}.name", pin): name,
                format!("gpioState.{}.name_customized", pin): true,
                format!("gpioState.{}.customized_at", pin):
                    server_timestamp(),
            }),
        )
        .await
}

/// Regenerates the smart default for a pin and clears the customized
/// flag.

pub async fn reset_pin_name(
    store: &Arc<dyn Store>,
    serial: &str,
    pin: u8,
) -> Result<()> {
    let desc = pins::lookup(pin).ok_or(Error::NotFound)?;
    let default = desc.default_name();

    store
        .update(
            &device_doc(serial),
            json!({
                format!("gpioState.{}.name", pin): default,
                format!("gpioState.{}.default_name", pin): default,
                format!("gpioState.{}.name_customized", pin): false,
                format!("gpioState.{}.customized_at", pin): Value::Null,
            }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hal::sim::SimHal, pins::PIN_TABLE, store::MemStore};

    fn fixture() -> (Arc<dyn Hal>, Arc<SimHal>, Arc<dyn Store>, Arc<MemStore>, Arc<PinCache>)
    {
        let sim = Arc::new(SimHal::new());
        let mem = Arc::new(MemStore::new());
        let cache = Arc::new(PinCache::new(PIN_TABLE));

        (
            sim.clone() as Arc<dyn Hal>,
            sim,
            mem.clone() as Arc<dyn Store>,
            mem,
            cache,
        )
    }

    const TIMEOUT: time::Duration = time::Duration::from_secs(10);

    #[tokio::test]
    async fn test_fresh_bootstrap() {
        let (hal, sim, store, mem, cache) = fixture();

        run(&hal, &store, "tester", &cache, TIMEOUT).await.unwrap();

        // Outputs are claimed and low.

        assert_eq!(sim.level(17), Some(false));
        assert_eq!(sim.level(18), Some(false));

        let doc = mem.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["hardware_serial"], "tester");
        assert_eq!(doc["status"], "online");

        let pin18 = &doc["gpioState"]["18"];

        assert_eq!(pin18["name"], "GPIO18 (PIN12) - LIGHT (PWM dimmable)");
        assert_eq!(pin18["default_name"], pin18["name"]);
        assert_eq!(pin18["name_customized"], json!(false));
        assert_eq!(pin18["type"], "actuator");
        assert_eq!(pin18["mode"], "output");
        assert_eq!(pin18["pwm_capable"], json!(true));
        assert_eq!(pin18["hardware_state"], json!(false));
        assert_eq!(pin18["mismatch"], json!(false));

        let pin4 = &doc["gpioState"]["4"];

        assert_eq!(pin4["type"], "sensor");
        assert_eq!(pin4["mode"], "input");

        // The controller never writes the operator's `state` field.

        assert!(pin18.get("state").is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_restores_persisted_state() {
        let (hal, sim, store, mem, cache) = fixture();

        mem.set(
            "devices/tester",
            json!({
                "gpioState": {
                    "17": {"state": true, "name": "Feed pump"},
                    "23": {"state": false}
                }
            }),
            false,
        )
        .await
        .unwrap();

        run(&hal, &store, "tester", &cache, TIMEOUT).await.unwrap();

        // Pin 17 comes back up high; pin 23 stays low.

        assert_eq!(sim.level(17), Some(true));
        assert_eq!(sim.level(23), Some(false));

        let state = *cache.entry(17).unwrap().lock().await;

        assert!(state.desired && state.hardware && state.last_remote);

        // The merge write preserved the operator's fields.

        let doc = mem.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["gpioState"]["17"]["state"], json!(true));
        assert_eq!(doc["gpioState"]["17"]["name"], "Feed pump");
    }

    #[tokio::test]
    async fn test_naming_rules() {
        let (hal, _, store, mem, cache) = fixture();

        mem.set(
            "devices/tester",
            json!({
                "gpioState": {
                    // Customized: never touched.
                    "17": {
                        "name": "Greenhouse pump",
                        "name_customized": true
                    },
                    // Legacy default: migrated.
                    "18": {"name": "GPIO 18", "name_customized": false},
                    // Unflagged but unrecognized: left alone.
                    "23": {"name": "Mystery relay"}
                }
            }),
            false,
        )
        .await
        .unwrap();

        run(&hal, &store, "tester", &cache, TIMEOUT).await.unwrap();

        let doc = mem.get("devices/tester").await.unwrap().unwrap();
        let gpio = &doc["gpioState"];

        assert_eq!(gpio["17"]["name"], "Greenhouse pump");
        assert_eq!(gpio["17"]["name_customized"], json!(true));
        assert_eq!(
            gpio["17"]["default_name"],
            "GPIO17 (PIN11) - PUMP (on/off)"
        );

        assert_eq!(
            gpio["18"]["name"],
            "GPIO18 (PIN12) - LIGHT (PWM dimmable)"
        );

        assert_eq!(gpio["23"]["name"], "Mystery relay");

        // Pins without entries got fresh defaults.

        assert_eq!(gpio["24"]["name"], "GPIO24 (PIN18) - GENERIC (on/off)");
    }

    #[tokio::test]
    async fn test_rename_and_reset() {
        let (hal, _, store, mem, cache) = fixture();

        run(&hal, &store, "tester", &cache, TIMEOUT).await.unwrap();

        rename_pin(&store, "tester", 17, "North bed pump")
            .await
            .unwrap();

        let doc = mem.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["gpioState"]["17"]["name"], "North bed pump");
        assert_eq!(doc["gpioState"]["17"]["name_customized"], json!(true));
        assert!(doc["gpioState"]["17"]["customized_at"].is_string());

        // Renaming to the current name doesn't rewrite the document.

        let before = mem.get("devices/tester").await.unwrap();

        rename_pin(&store, "tester", 17, "North bed pump")
            .await
            .unwrap();
        assert_eq!(mem.get("devices/tester").await.unwrap(), before);

        reset_pin_name(&store, "tester", 17).await.unwrap();

        let doc = mem.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(
            doc["gpioState"]["17"]["name"],
            "GPIO17 (PIN11) - PUMP (on/off)"
        );
        assert_eq!(doc["gpioState"]["17"]["name_customized"], json!(false));

        // Unmanaged pins are rejected.

        assert_eq!(
            rename_pin(&store, "tester", 9, "x").await,
            Err(Error::NotFound)
        );
    }
}
