//! Process metrics sampled for every worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Snapshot taken when a worker is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    /// Resident memory of this process in MiB.
    pub mem_mb: f64,
    /// Worker tasks alive at the time of the sample.
    pub live_workers: usize,
}

/// Reads process memory and tracks how many worker tasks are alive.
pub struct ProcessProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    live_workers: Arc<AtomicUsize>,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a live worker until the returned gauge is dropped.
    pub fn enter(&self) -> WorkerGauge {
        self.live_workers.fetch_add(1, Ordering::Relaxed);
        WorkerGauge {
            live_workers: Arc::clone(&self.live_workers),
        }
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }

    /// Resident memory in MiB, or 0 if it cannot be read.
    pub fn memory_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0.0;
        };

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system
            .process(pid)
            .map(|process| process.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }

    pub fn sample(&self) -> ProcessSample {
        ProcessSample {
            mem_mb: self.memory_mb(),
            live_workers: self.live_workers(),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the live worker count on drop.
#[derive(Debug)]
pub struct WorkerGauge {
    live_workers: Arc<AtomicUsize>,
}

impl Drop for WorkerGauge {
    fn drop(&mut self) {
        self.live_workers.fetch_sub(1, Ordering::Relaxed);
    }
}
