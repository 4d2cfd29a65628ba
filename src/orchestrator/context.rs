use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use crate::config::EngineConfig;
use crate::handoff::HandoffChannel;
use crate::health::HealthBoard;
use crate::reconcile::CompletionReconciler;
use crate::stability::StabilityGate;
use crate::store::{EventLog, JobStore, MachineRegistry};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Everything the scan handlers share. Owned by the orchestrator and handed
/// to each handler explicitly.
pub struct ScanContext {
    pub config: EngineConfig,
    pub store: Arc<dyn JobStore>,
    pub events: Arc<dyn EventLog>,
    pub machines: Arc<dyn MachineRegistry>,
    pub gate: StabilityGate,
    pub locks: JobLocks,
    pub pallets: PalletAllocator,
    pub health: HealthBoard,
    pub handoff: HandoffChannel,
    pub reconciler: CompletionReconciler,
    inflight: Mutex<HashSet<u32>>,
}

impl ScanContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        events: Arc<dyn EventLog>,
        machines: Arc<dyn MachineRegistry>,
    ) -> Self {
        Self {
            gate: StabilityGate::new(config.stable_window(), config.force_window()),
            locks: JobLocks::default(),
            pallets: PalletAllocator::new(config.pallet_slots),
            health: HealthBoard::new(),
            handoff: HandoffChannel::new(config.handoff.mailbox_options()),
            reconciler: CompletionReconciler::new(config.archive_dir_name.clone()),
            inflight: Mutex::new(HashSet::new()),
            config,
            store,
            events,
            machines,
        }
    }

    /// Claim the handoff slot for `machine_id`. `None` while another handoff
    /// for the same machine is still running.
    pub fn claim_handoff(self: &Arc<Self>, machine_id: u32) -> Option<HandoffClaim> {
        if lock(&self.inflight).insert(machine_id) {
            Some(HandoffClaim {
                ctx: Arc::clone(self),
                machine_id,
            })
        } else {
            None
        }
    }

    pub fn handoff_in_flight(&self, machine_id: u32) -> bool {
        lock(&self.inflight).contains(&machine_id)
    }
}

/// Releases the per-machine handoff slot on drop.
pub struct HandoffClaim {
    ctx: Arc<ScanContext>,
    machine_id: u32,
}

impl Drop for HandoffClaim {
    fn drop(&mut self) {
        lock(&self.ctx.inflight).remove(&self.machine_id);
    }
}

/// One async mutex per job key, so updates to a single job run one at a time
/// while different jobs proceed in parallel.
#[derive(Debug, Default)]
pub struct JobLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let m = {
            let mut locks = lock(&self.locks);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        m.lock_owned().await
    }

    /// Drop entries nobody is holding or waiting on.
    pub fn prune(&self) {
        lock(&self.locks).retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }
}

/// Hands out pallet slots per machine in rotation: `Pallet_A01` ..
/// `Pallet_A<slots>`, then back to `Pallet_A01`.
#[derive(Debug)]
pub struct PalletAllocator {
    slots: u32,
    next: tokio::sync::Mutex<HashMap<Option<u32>, u32>>,
}

impl PalletAllocator {
    pub fn new(slots: u32) -> Self {
        Self {
            slots: slots.max(1),
            next: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Hold the next slot for `machine_id` until the reservation is committed
    /// or dropped. Other reservations wait meanwhile.
    pub async fn reserve(&self, machine_id: Option<u32>) -> PalletReservation<'_> {
        PalletReservation {
            slots: self.slots,
            machine_id,
            next: self.next.lock().await,
        }
    }
}

/// A pallet slot that is only consumed by [`PalletReservation::commit`].
pub struct PalletReservation<'a> {
    slots: u32,
    machine_id: Option<u32>,
    next: tokio::sync::MutexGuard<'a, HashMap<Option<u32>, u32>>,
}

impl PalletReservation<'_> {
    pub fn name(&self) -> String {
        let counter = self.next.get(&self.machine_id).copied().unwrap_or(0);
        format!("Pallet_A{:02}", counter % self.slots + 1)
    }

    pub fn commit(mut self) {
        let counter = self.next.entry(self.machine_id).or_insert(0);
        *counter = counter.wrapping_add(1);
    }
}
