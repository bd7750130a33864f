//! Admission gate: shared/exclusive task holds plus a memory budget
//!
//! A hold is acquired by the producer at submission time and released by the
//! worker that ran the task, so it is expressed as an owned guard that moves
//! with the task rather than a scope-bound lock. Barrier (exclusive) holds
//! wait for every outstanding shared hold to drain and block new shared
//! holds for their duration; tokio's RwLock queues fairly, so a pending
//! barrier is not starved by a stream of shared admissions.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Default part size assumed for multipart-style uploads
const PART_SIZE: u64 = 128 * 1024 * 1024;

/// Buffers a multipart upload keeps in flight at once
const MAX_PARTS_IN_FLIGHT: u64 = 3;

/// Fraction of available system memory taken as the budget
const BUDGET_FRACTION: f64 = 0.8;

/// Hold on the gate for the full execution of one task
///
/// Dropping the hold releases it; the scheduler moves it into the worker
/// and drops it when the task completes.
#[derive(Debug)]
pub enum AdmissionHold {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Mutual-exclusion and memory-backpressure primitive guarding task intake
pub struct AdmissionGate {
    lock: Arc<RwLock<()>>,
    /// One-time budget computed at scheduler start; 0 disables the check
    max_mem: u64,
    sampler: Mutex<System>,
    pid: Option<Pid>,
}

impl AdmissionGate {
    /// Gate with a budget measured from available system memory
    pub fn new() -> Self {
        let mut sampler = System::new();
        sampler.refresh_memory();
        let max_mem = (sampler.available_memory() as f64 * BUDGET_FRACTION) as u64;
        Self::with_sampler(max_mem, sampler)
    }

    /// Gate with an explicit budget in bytes (0 disables the memory check)
    pub fn with_budget(max_mem: u64) -> Self {
        Self::with_sampler(max_mem, System::new())
    }

    fn with_sampler(max_mem: u64, sampler: System) -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            max_mem,
            sampler: Mutex::new(sampler),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// The budget this gate admits against
    pub fn budget(&self) -> u64 {
        self.max_mem
    }

    /// Acquire a shared hold; blocks while an exclusive hold is outstanding
    /// or pending.
    pub async fn shared(&self) -> AdmissionHold {
        AdmissionHold::Shared(Arc::clone(&self.lock).read_owned().await)
    }

    /// Acquire an exclusive hold; blocks until all shared holds drain.
    pub async fn exclusive(&self) -> AdmissionHold {
        AdmissionHold::Exclusive(Arc::clone(&self.lock).write_owned().await)
    }

    /// Whether a transfer of `upload_size` bytes fits in the budget given
    /// current process memory use. Tasks that do not fit are promoted to the
    /// barrier class by the scheduler, serializing them instead of failing.
    pub fn within_budget(&self, upload_size: u64) -> bool {
        if upload_size == 0 || self.max_mem == 0 {
            return true;
        }
        estimate_transfer_memory(upload_size).saturating_add(self.process_memory()) < self.max_mem
    }

    fn process_memory(&self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let mut sampler = self.sampler.lock();
        sampler.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        sampler.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory needed for one transfer: the whole object for small ones, a fixed
/// number of part buffers once multipart kicks in.
fn estimate_transfer_memory(size: u64) -> u64 {
    if size / PART_SIZE >= MAX_PARTS_IN_FLIGHT {
        MAX_PARTS_IN_FLIGHT * PART_SIZE
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_memory_is_capped() {
        assert_eq!(estimate_transfer_memory(10), 10);
        assert_eq!(estimate_transfer_memory(PART_SIZE), PART_SIZE);
        // A 100 GiB object only needs a handful of part buffers.
        assert_eq!(
            estimate_transfer_memory(100 * 1024 * 1024 * 1024),
            MAX_PARTS_IN_FLIGHT * PART_SIZE
        );
    }

    #[test]
    fn test_zero_budget_disables_check() {
        let gate = AdmissionGate::with_budget(0);
        assert!(gate.within_budget(u64::MAX));
    }

    #[test]
    fn test_small_budget_rejects_large_transfer() {
        let gate = AdmissionGate::with_budget(1024);
        assert!(gate.within_budget(0));
        assert!(!gate.within_budget(1 << 40));
    }

    #[tokio::test]
    async fn test_shared_holds_coexist() {
        let gate = AdmissionGate::with_budget(0);
        let a = gate.shared().await;
        let b = gate.shared().await;
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared() {
        let gate = Arc::new(AdmissionGate::with_budget(0));
        let shared = gate.shared().await;

        let g = Arc::clone(&gate);
        let pending = tokio::spawn(async move {
            let _hold = g.exclusive().await;
        });

        // The exclusive acquire cannot complete while the shared hold lives.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        drop(shared);
        pending.await.unwrap();
    }
}
