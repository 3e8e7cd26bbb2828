//! The per-pin state cache.
//!
//! This is the sole arbiter of "current truth" for every pin: what
//! the remote document last said (`last_remote`), what the remote
//! wants (`desired`), and what the hardware last reported
//! (`hardware`). Each pin carries its own mutex; holding that mutex
//! is the per-pin exclusive section that serializes every HAL drive.
//! `hardware` must only be written while the mutex is held, right
//! after the corresponding HAL call.

use pinbridge_api::types::pin::PinDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Mutable state of one pin.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    /// What the remote document says the pin should be.
    pub desired: bool,

    /// What the HAL last read from (or wrote to) the physical pin.
    pub hardware: bool,

    /// The last `state` value observed on the remote document.
    /// Tracked separately from `hardware` so writes the controller
    /// itself makes to the document don't self-trigger the listener.
    pub last_remote: bool,

    /// Set when an operator command preempts a running schedule on
    /// this pin; cleared when the last executor on the pin ends.
    pub user_override_active: bool,

    /// Last PWM duty driven, 0..100.
    pub pwm_duty: u8,

    /// Bumped on every HAL drive of this pin. One-shot timers capture
    /// it and fire only if nothing else drove the pin in between.
    pub seq: u64,
}

impl PinState {
    fn new() -> PinState {
        PinState {
            desired: false,
            hardware: false,
            last_remote: false,
            user_override_active: false,
            pwm_duty: 0,
            seq: 0,
        }
    }

    /// Records that the pin was just driven.

    pub fn note_drive(&mut self) {
        self.seq = self.seq.wrapping_add(1)
    }
}

/// One pin's slot in the cache: the static descriptor plus the mutex
/// guarding its state.

pub struct PinEntry {
    pub desc: PinDescriptor,
    state: Mutex<PinState>,
}

impl PinEntry {
    /// Enters the pin's exclusive section.

    pub async fn lock(&self) -> MutexGuard<'_, PinState> {
        self.state.lock().await
    }
}

/// A copy of one pin's state, taken for the sync-loop writer.

#[derive(Debug, Clone, Copy)]
pub struct PinSnapshot {
    pub desc: PinDescriptor,
    pub state: PinState,
}

/// The cache itself. The pin set is fixed at bootstrap; the outer map
/// is never mutated afterwards, so lookups hand out `Arc` clones
/// without further locking.

pub struct PinCache {
    pins: HashMap<u8, Arc<PinEntry>>,
    order: Vec<u8>,
}

impl PinCache {
    /// Builds a cache slot for every descriptor. All pins start low
    /// with no override.

    pub fn new(descs: &[PinDescriptor]) -> PinCache {
        let mut pins = HashMap::new();
        let mut order = Vec::with_capacity(descs.len());

        for desc in descs {
            pins.insert(
                desc.number,
                Arc::new(PinEntry {
                    desc: *desc,
                    state: Mutex::new(PinState::new()),
                }),
            );
            order.push(desc.number);
        }

        PinCache { pins, order }
    }

    /// Looks up the entry for a pin. `None` means the pin isn't
    /// managed by this controller.

    pub fn entry(&self, pin: u8) -> Option<Arc<PinEntry>> {
        self.pins.get(&pin).cloned()
    }

    /// All entries, in pin-table order.

    pub fn entries(&self) -> Vec<Arc<PinEntry>> {
        self.order
            .iter()
            .map(|pin| self.pins[pin].clone())
            .collect()
    }

    /// Deep-copies the state of every pin. Used by the sync-loop
    /// writer so it never holds a pin mutex across a store RPC.

    pub async fn snapshot(&self) -> Vec<PinSnapshot> {
        let mut result = Vec::with_capacity(self.order.len());

        for pin in &self.order {
            let entry = &self.pins[pin];

            result.push(PinSnapshot {
                desc: entry.desc,
                state: *entry.lock().await,
            });
        }
        result
    }
}
