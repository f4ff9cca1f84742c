//! Dedicated polling threads for bridge-wrapped NICs.
//!
//! Polling replaces receive interrupts: while active, the NIC's interrupts
//! are disabled and pinned threads call the interrupt path in a loop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SwitchError};
use crate::nic::{NicAdapter, NotifyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingMode {
    /// One thread serves every receive ring.
    SingleCpu,
    /// One thread per ring, each on its own CPU.
    MultiCpu,
}

/// Resolved polling layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollingPlan {
    pub mode: PollingMode,
    /// First polled ring.
    pub qfirst: usize,
    /// One past the last polled ring.
    pub qlast: usize,
    pub cpu_from: usize,
    pub ncpus: usize,
}

impl PollingPlan {
    /// Rings served by thread `i`.
    fn rings(&self, i: usize) -> std::ops::Range<usize> {
        match self.mode {
            PollingMode::SingleCpu => self.qfirst..self.qlast,
            PollingMode::MultiCpu => self.qfirst + i..self.qfirst + i + 1,
        }
    }
}

/// Validate a polling request against `nrings` receive rings and `avail`
/// CPUs.
///
/// In multi-CPU mode `first` names both the first ring and the first CPU:
/// rings `first..first + num_cpus` are polled by CPUs with the same index.
pub fn plan(
    mode: PollingMode,
    first: usize,
    num_cpus: usize,
    nrings: usize,
    avail: usize,
) -> Result<PollingPlan> {
    if num_cpus == 0 {
        return Err(SwitchError::InvalidArgument(
            "polling needs at least one CPU".into(),
        ));
    }
    if num_cpus >= avail {
        return Err(SwitchError::InvalidArgument(format!(
            "cannot use all {avail} CPUs for polling"
        )));
    }
    match mode {
        PollingMode::MultiCpu => {
            if first + num_cpus > nrings {
                return Err(SwitchError::InvalidArgument(format!(
                    "rings {first}..{} exceed the {nrings} receive rings",
                    first + num_cpus
                )));
            }
            if first + num_cpus > avail {
                return Err(SwitchError::InvalidArgument(format!(
                    "CPUs {first}..{} exceed the {avail} available",
                    first + num_cpus
                )));
            }
            Ok(PollingPlan {
                mode,
                qfirst: first,
                qlast: first + num_cpus,
                cpu_from: first,
                ncpus: num_cpus,
            })
        }
        PollingMode::SingleCpu => {
            if num_cpus != 1 {
                return Err(SwitchError::InvalidArgument(format!(
                    "single CPU polling with {num_cpus} CPUs"
                )));
            }
            if first >= avail {
                return Err(SwitchError::InvalidArgument(format!(
                    "CPU {first} out of range ({avail} available)"
                )));
            }
            Ok(PollingPlan {
                mode,
                qfirst: 0,
                qlast: nrings,
                cpu_from: first,
                ncpus: 1,
            })
        }
    }
}

/// Running polling threads of one NIC.
pub struct PollingHandle {
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    plan: PollingPlan,
}

impl PollingHandle {
    /// Disable interrupts on `nic` and spawn the threads of `plan`.
    pub(crate) fn start(nic: &Arc<NicAdapter>, plan: PollingPlan) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        nic.set_interrupts(false);

        let mut handle = Self {
            shutdown: Some(shutdown_tx),
            threads: Vec::with_capacity(plan.ncpus),
            plan,
        };
        for i in 0..plan.ncpus {
            let thread_nic = nic.clone();
            let rx = shutdown_rx.clone();
            let cpu = plan.cpu_from + i;
            let rings = plan.rings(i);
            let spawned = thread::Builder::new()
                .name(format!("poll-{}-{i}", nic.name()))
                .spawn(move || poll_loop(thread_nic, rx, cpu, rings));
            match spawned {
                Ok(t) => handle.threads.push(t),
                Err(e) => {
                    error!(nic = %nic.name(), error = %e, "Failed to spawn polling thread");
                    handle.stop(nic);
                    return Err(SwitchError::Io(e));
                }
            }
        }
        info!(
            nic = %nic.name(),
            mode = ?plan.mode,
            rings = ?(plan.qfirst..plan.qlast),
            cpu_from = plan.cpu_from,
            "Polling started"
        );
        Ok(handle)
    }

    pub fn plan(&self) -> &PollingPlan {
        &self.plan
    }

    /// Stop the threads, wait for them and re-enable interrupts.
    pub(crate) fn stop(mut self, nic: &NicAdapter) {
        drop(self.shutdown.take());
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                error!(nic = %nic.name(), "Polling thread panicked");
            }
        }
        nic.set_interrupts(true);
        info!(nic = %nic.name(), "Polling stopped");
    }
}

fn pin_to_cpu(cpu: usize) {
    let mut set = CpuSet::new();
    if let Err(e) = set.set(cpu) {
        warn!(cpu, error = %e, "Invalid CPU for polling thread");
        return;
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!(cpu, error = %e, "Failed to pin polling thread");
    }
}

fn poll_loop(
    nic: Arc<NicAdapter>,
    shutdown: Receiver<()>,
    cpu: usize,
    rings: std::ops::Range<usize>,
) {
    pin_to_cpu(cpu);
    debug!(nic = %nic.name(), cpu, rings = ?rings, "Polling thread running");
    loop {
        match shutdown.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }
        let mut busy = false;
        for r in rings.clone() {
            if nic.interrupt(r) == NotifyOutcome::Reschedule {
                busy = true;
            }
        }
        if !busy {
            thread::yield_now();
        }
    }
    debug!(nic = %nic.name(), cpu, "Polling thread exiting");
}
