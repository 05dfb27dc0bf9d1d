//! Write pressure on the ring buffer: one pinned writer thread per CPU,
//! writing numbered entries (and a page marker every
//! `marker_entries_per_page` entries) to `trace_marker`.

use crate::config::Config;
use crate::control::ControlSurface;
use crate::types::CpuId;
use crate::types::CpuSet;
use crate::types::TraceWindow;
use nix::sched::CpuSet as AffinitySet;
use rand::Rng;
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// Error type for load generation. Apart from [`GenError::NoCpus`] these
/// degrade the run but never abort it; they are collected in the
/// [`WriteSummary`].
#[derive(Debug, thiserror::Error)]
pub enum GenError {
    #[error("No CPUs to write on")]
    NoCpus,
    #[error("Failed to pin writer to CPU {cpu}: {source}")]
    Affinity { cpu: CpuId, source: nix::Error },
    #[error("Failed to open {path} for CPU {cpu}: {source}")]
    Open {
        cpu: CpuId,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Write to trace_marker failed on CPU {cpu}: {source}")]
    Write { cpu: CpuId, source: std::io::Error },
    #[error("Writer thread for CPU {cpu} panicked")]
    Panicked { cpu: CpuId },
}

/// Shared cancellation flag for the writer threads.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

/// Longest single sleep, so a raised signal is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early if the signal is raised.
    fn sleep(&self, duration: Duration) {
        let end = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if self.is_raised() || now >= end {
                return;
            }
            std::thread::sleep((end - now).min(SLEEP_SLICE));
        }
    }
}

/// Writes attempted on one CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuWrites {
    pub writes: u64,
    pub markers: u64,
    /// Whether the writer thread was pinned to the CPU. When false, entries
    /// may have landed in another CPU's buffer.
    pub pinned: bool,
}

/// What the load generator attempted. A lower bound for sanity checks, not
/// ground truth: wraparound and filtering legitimately lose entries.
#[derive(Debug, Default, Serialize)]
pub struct WriteSummary {
    pub per_cpu: BTreeMap<CpuId, CpuWrites>,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<GenError>,
}

fn serialize_errors<S>(errors: &[GenError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

impl WriteSummary {
    pub fn total_writes(&self) -> u64 {
        self.per_cpu.values().map(|w| w.writes).sum()
    }

    /// True if any writer ran unpinned or hit an error.
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty() || self.per_cpu.values().any(|w| !w.pinned)
    }
}

#[derive(Debug)]
pub struct LoadGenerator {
    marker_path: PathBuf,
    write_tag: String,
    marker_text: String,
    entries_per_page: u64,
}

impl LoadGenerator {
    pub fn new(surface: &ControlSurface, config: &Config) -> Self {
        Self {
            marker_path: surface.path("trace_marker"),
            write_tag: config.write_tag.clone(),
            marker_text: config.marker_text.clone(),
            entries_per_page: config.marker_entries_per_page as u64,
        }
    }

    /// Write on every CPU in `cpus` until the window elapses or `stop` is
    /// raised, sleeping a random delay in `[0, max_delay]` between writes.
    /// All writer threads are joined before this returns.
    pub fn drive(
        &self,
        cpus: &CpuSet,
        window: TraceWindow,
        max_delay: Duration,
        stop: &StopSignal,
    ) -> Result<WriteSummary, GenError> {
        if cpus.is_empty() {
            return Err(GenError::NoCpus);
        }
        let deadline = Instant::now() + window.duration();
        let mut summary = WriteSummary::default();
        std::thread::scope(|scope| {
            let writers: Vec<_> = cpus
                .iter()
                .map(|cpu| {
                    let handle =
                        scope.spawn(move || self.write_on(cpu, deadline, max_delay, stop));
                    (cpu, handle)
                })
                .collect();
            for (cpu, handle) in writers {
                match handle.join() {
                    Ok((writes, errors)) => {
                        summary.per_cpu.insert(cpu, writes);
                        summary.errors.extend(errors);
                    }
                    Err(_) => summary.errors.push(GenError::Panicked { cpu }),
                }
            }
        });
        log::info!(
            "Wrote {} entries on {} CPUs{}",
            summary.total_writes(),
            cpus.len(),
            if summary.is_degraded() {
                " (degraded)"
            } else {
                ""
            }
        );
        Ok(summary)
    }

    fn write_on(
        &self,
        cpu: CpuId,
        deadline: Instant,
        max_delay: Duration,
        stop: &StopSignal,
    ) -> (CpuWrites, Vec<GenError>) {
        let mut errors = Vec::new();
        let mut counts = CpuWrites {
            pinned: true,
            ..CpuWrites::default()
        };
        if let Err(source) = pin_to_cpu(cpu) {
            log::warn!("Failed to pin writer to CPU {cpu}: {source}");
            counts.pinned = false;
            errors.push(GenError::Affinity { cpu, source });
        }
        let mut marker = match std::fs::OpenOptions::new()
            .append(true)
            .open(&self.marker_path)
        {
            Ok(file) => file,
            Err(source) => {
                errors.push(GenError::Open {
                    cpu,
                    path: self.marker_path.clone(),
                    source,
                });
                return (counts, errors);
            }
        };
        let mut rng = rand::thread_rng();
        let max_delay_us = u64::try_from(max_delay.as_micros()).unwrap_or(u64::MAX);

        while !stop.is_raised() && Instant::now() < deadline {
            let entry = format!("{} cpu={cpu} seq={}\n", self.write_tag, counts.writes);
            if let Err(source) = marker.write_all(entry.as_bytes()) {
                errors.push(GenError::Write { cpu, source });
                break;
            }
            counts.writes += 1;
            if counts.writes % self.entries_per_page == 0 {
                let page = format!("{} cpu={cpu} page={}\n", self.marker_text, counts.markers);
                if let Err(source) = marker.write_all(page.as_bytes()) {
                    errors.push(GenError::Write { cpu, source });
                    break;
                }
                counts.markers += 1;
            }
            if max_delay_us > 0 {
                stop.sleep(Duration::from_micros(rng.gen_range(0..=max_delay_us)));
            }
        }
        log::debug!(
            "CPU {cpu}: {} writes, {} markers",
            counts.writes,
            counts.markers
        );
        (counts, errors)
    }
}

/// Pin the calling thread to `cpu`.
fn pin_to_cpu(cpu: CpuId) -> Result<(), nix::Error> {
    let mut set = AffinitySet::new();
    set.set(cpu.0 as usize)?;
    nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)
}
