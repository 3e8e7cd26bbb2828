//! The hardware sync loop.
//!
//! The reader polls physical output pins on a fast cadence and
//! refreshes the cache. The writer snapshots the cache on a slower
//! cadence and reports observed state, per-pin mismatch, and the
//! heartbeat to the device document in one update. Writer failures
//! skip the cycle; the next one makes the document correct anyway.

use crate::{cache::PinCache, store::rpc};
use pinbridge_api::{
    hal::Hal,
    store::{device_doc, server_timestamp, Store},
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{info, warn};

/// Polls every output pin and refreshes the cache's `hardware`
/// values.

pub async fn reader(
    hal: Arc<dyn Hal>,
    cache: Arc<PinCache>,
    interval: time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!("starting");

    let mut ticker = time::interval(interval);

    loop {
        #[rustfmt::skip]
        tokio::select! {
            _ = ticker.tick() => read_pass(&hal, &cache).await,
            _ = stop.changed() => break
        }
    }

    info!("stopped")
}

async fn read_pass(hal: &Arc<dyn Hal>, cache: &PinCache) {
    for entry in cache.entries() {
        if !entry.desc.is_output() {
            continue;
        }

        // Read inside the pin's exclusive section so the cached value
        // always matches the most recent HAL interaction.

        let mut state = entry.lock().await;

        match hal.read_digital(entry.desc.number) {
            Ok(v) => state.hardware = v,
            Err(e) => {
                warn!("couldn't read pin {} -- {}", entry.desc.number, e)
            }
        }
    }
}

// Builds the writer's update payload from a cache snapshot.

fn sync_payload(snap: &[crate::cache::PinSnapshot]) -> Value {
    let mut fields = Map::new();

    for pin in snap {
        if !pin.desc.is_output() {
            continue;
        }

        let n = pin.desc.number;

        fields.insert(
            format!("gpioState.{}.hardware_state", n),
            Value::Bool(pin.state.hardware),
        );
        fields.insert(
            format!("gpioState.{}.mismatch", n),
            Value::Bool(pin.state.desired != pin.state.hardware),
        );
        fields.insert(
            format!("gpioState.{}.last_hardware_read", n),
            server_timestamp(),
        );
    }

    fields.insert(String::from("status"), Value::String("online".into()));
    fields.insert(String::from("last_heartbeat"), server_timestamp());

    Value::Object(fields)
}

/// Periodically reports the cache to the device document. On stop, a
/// final best-effort update marks the device offline.

pub async fn writer(
    store: Arc<dyn Store>,
    serial: String,
    cache: Arc<PinCache>,
    interval: time::Duration,
    rpc_timeout: time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!("starting");

    let path = device_doc(&serial);
    let mut ticker = time::interval(interval);

    loop {
        #[rustfmt::skip]
        tokio::select! {
            _ = ticker.tick() => {
                let snap = cache.snapshot().await;
                let fields = sync_payload(&snap);

                // No retry; the next cycle carries fresher data
                // anyway.

                if let Err(e) =
                    rpc(rpc_timeout, store.update(&path, fields)).await
                {
                    warn!("skipping sync write -- {}", e)
                }
            },
            _ = stop.changed() => break
        }
    }

    let offline = serde_json::json!({
        "status": "offline",
        "last_heartbeat": server_timestamp(),
    });

    if let Err(e) = rpc(rpc_timeout, store.update(&path, offline)).await {
        warn!("couldn't record offline status -- {}", e)
    }

    info!("stopped")
}

/// Refreshes the heartbeat on its own cadence, for deployments where
/// it runs faster than the full sync write.

pub async fn heartbeat(
    store: Arc<dyn Store>,
    serial: String,
    interval: time::Duration,
    rpc_timeout: time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let path = device_doc(&serial);
    let mut ticker = time::interval(interval);

    loop {
        #[rustfmt::skip]
        tokio::select! {
            _ = ticker.tick() => {
                let fields = serde_json::json!({
                    "status": "online",
                    "last_heartbeat": server_timestamp(),
                });

                if let Err(e) =
                    rpc(rpc_timeout, store.update(&path, fields)).await
                {
                    warn!("skipping heartbeat -- {}", e)
                }
            },
            _ = stop.changed() => break
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hal::sim::SimHal, pins::PIN_TABLE, store::MemStore};
    use serde_json::json;

    async fn fixture() -> (Arc<SimHal>, Arc<PinCache>, Arc<MemStore>) {
        let hal = Arc::new(SimHal::new());
        let cache = Arc::new(PinCache::new(PIN_TABLE));
        let store = Arc::new(MemStore::new());

        for entry in cache.entries() {
            hal.configure(&entry.desc).unwrap()
        }

        store
            .set("devices/tester", json!({"gpioState": {}}), false)
            .await
            .unwrap();

        (hal, cache, store)
    }

    #[tokio::test]
    async fn test_read_pass_refreshes_cache() {
        let (hal, cache, _) = fixture().await;
        let dyn_hal: Arc<dyn Hal> = hal.clone();

        // Drive the pin behind the cache's back.

        hal.set_digital(17, true).unwrap();
        assert!(!cache.entry(17).unwrap().lock().await.hardware);

        read_pass(&dyn_hal, &cache).await;
        assert!(cache.entry(17).unwrap().lock().await.hardware);

        // Input pins are not polled.

        assert!(!cache.entry(4).unwrap().lock().await.hardware);
    }

    #[tokio::test]
    async fn test_sync_payload_reports_mismatch() {
        let (_, cache, _) = fixture().await;

        {
            let entry = cache.entry(17).unwrap();
            let mut state = entry.lock().await;

            state.desired = true;
            state.hardware = false;
        }

        let snap = cache.snapshot().await;
        let payload = sync_payload(&snap);

        assert_eq!(payload["gpioState.17.mismatch"], json!(true));
        assert_eq!(payload["gpioState.17.hardware_state"], json!(false));
        assert_eq!(payload["gpioState.23.mismatch"], json!(false));
        assert_eq!(payload["status"], "online");
        assert!(payload.get("gpioState.4.hardware_state").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_updates_document_and_goes_offline() {
        let (_, cache, store) = fixture().await;
        let (tx_stop, rx_stop) = watch::channel(false);
        let task = tokio::spawn(writer(
            store.clone() as Arc<dyn Store>,
            String::from("tester"),
            cache.clone(),
            time::Duration::from_secs(30),
            time::Duration::from_secs(10),
            rx_stop,
        ));

        time::sleep(time::Duration::from_secs(1)).await;

        let doc = store.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["status"], "online");
        assert!(doc["last_heartbeat"].is_string());
        assert_eq!(doc["gpioState"]["17"]["hardware_state"], json!(false));

        let _ = tx_stop.send(true);
        task.await.unwrap();

        let doc = store.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["status"], "offline");
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_skips_failed_cycles() {
        let (_, cache, store) = fixture().await;
        let (tx_stop, rx_stop) = watch::channel(false);

        store.fail_next_writes(1);

        let task = tokio::spawn(writer(
            store.clone() as Arc<dyn Store>,
            String::from("tester"),
            cache.clone(),
            time::Duration::from_secs(30),
            time::Duration::from_secs(10),
            rx_stop,
        ));

        // First cycle fails and is skipped.

        time::sleep(time::Duration::from_secs(1)).await;

        let doc = store.get("devices/tester").await.unwrap().unwrap();

        assert!(doc.get("status").is_none());

        // The next cycle recovers without any retry logic.

        time::sleep(time::Duration::from_secs(30)).await;

        let doc = store.get("devices/tester").await.unwrap().unwrap();

        assert_eq!(doc["status"], "online");

        let _ = tx_stop.send(true);
        task.await.unwrap();
    }
}
