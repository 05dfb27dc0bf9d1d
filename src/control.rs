//! Programming the kernel tracing control surface (tracefs).
//!
//! The control surface is one shared resource per run, so it is modelled as
//! an owned [`ControlSurface`] handle given to the [`TracerController`].
//! Every knob changed while enabling is remembered and restored on disable,
//! and a [`TracingSession`] disables on drop so that no exit path leaves
//! tracing on.

use crate::config::Config;
use crate::types::CpuSet;
use crate::types::TraceWindow;
use crate::types::TracerName;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

/// Error type for control surface operations. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Tracing control file {path} does not exist")]
    Missing { path: PathBuf },
    #[error("Failed to write \"{value}\" to {path}: {source}")]
    Write {
        path: PathBuf,
        value: String,
        source: std::io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Tracer {tracer} is not available (available: {available})")]
    Unsupported { tracer: String, available: String },
    #[error("Tracing is not enabled")]
    NotEnabled,
}

/// Handle to a tracefs mount (or instance) directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSurface {
    root: PathBuf,
}

impl ControlSurface {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, knob: &str) -> PathBuf {
        self.root.join(knob)
    }

    pub fn exists(&self, knob: &str) -> bool {
        self.path(knob).exists()
    }

    pub fn read(&self, knob: &str) -> Result<String, ControlError> {
        let path = self.path(knob);
        std::fs::read_to_string(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ControlError::Missing { path },
            _ => ControlError::Read { path, source },
        })
    }

    /// Write `value` the way `echo value > knob` does (truncating open).
    pub fn write(&self, knob: &str, value: &str) -> Result<(), ControlError> {
        let path = self.path(knob);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path);
        let result = file.and_then(|mut f| f.write_all(value.as_bytes()));
        result.map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ControlError::Missing { path },
            _ => ControlError::Write {
                path,
                value: value.to_owned(),
                source,
            },
        })
    }
}

/// Which CPUs the enabled tracer records on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    PerCpu(CpuSet),
    /// Per-CPU scoping is unavailable or disabled; every CPU records.
    Global,
}

/// A knob value to put back on disable.
#[derive(Debug)]
struct Saved {
    knob: String,
    value: String,
}

#[derive(Debug)]
pub struct TracerController {
    surface: ControlSurface,
    buffer_size_kb: Option<u64>,
    global_scope: bool,
    events: Vec<String>,
    enabled: Option<(TracerName, Scope)>,
    saved: Vec<Saved>,
    enabled_events: Vec<String>,
}

impl TracerController {
    pub fn new(surface: ControlSurface, config: &Config) -> Self {
        Self {
            surface,
            buffer_size_kb: config.buffer_size_kb,
            global_scope: config.global_scope,
            events: config.events.clone(),
            enabled: None,
            saved: Vec::new(),
            enabled_events: Vec::new(),
        }
    }

    /// The active tracer and its scope, if tracing is enabled.
    pub fn enabled(&self) -> Option<&(TracerName, Scope)> {
        self.enabled.as_ref()
    }

    /// Activate `tracer` on `cpus`. On failure the surface is put back to a
    /// disabled state before returning.
    pub fn enable(&mut self, tracer: TracerName, cpus: &CpuSet) -> Result<(), ControlError> {
        if self.enabled.is_some() {
            self.disable()?;
        }
        match self.program(tracer, cpus) {
            Ok(scope) => {
                log::info!("Enabled tracer {tracer} ({scope:?})");
                self.enabled = Some((tracer, scope));
                Ok(())
            }
            Err(err) => {
                if let Err(reset_err) = self.reset() {
                    log::error!("Failed to reset tracing after failed enable: {reset_err}");
                }
                Err(err)
            }
        }
    }

    /// [`Self::enable`], returning a guard that disables on drop.
    pub fn enable_session(
        &mut self,
        tracer: TracerName,
        cpus: &CpuSet,
    ) -> Result<TracingSession<'_>, ControlError> {
        self.enable(tracer, cpus)?;
        Ok(TracingSession { controller: self })
    }

    /// Block for the duration of `window` while tracing stays on.
    pub fn run_for(&self, window: TraceWindow) -> Result<(), ControlError> {
        if self.enabled.is_none() {
            return Err(ControlError::NotEnabled);
        }
        let start = Instant::now();
        std::thread::sleep(window.duration());
        let elapsed = start.elapsed();
        // Overruns are reported, never retried.
        if elapsed > window.duration() + window.duration() / 10 {
            log::warn!(
                "Trace window of {window} overran to {}ms",
                elapsed.as_millis()
            );
        }
        Ok(())
    }

    /// Stop tracing. A no-op when already disabled.
    pub fn disable(&mut self) -> Result<(), ControlError> {
        if self.enabled.is_none() {
            return Ok(());
        }
        self.reset()?;
        log::info!("Disabled tracing");
        Ok(())
    }

    fn program(&mut self, tracer: TracerName, cpus: &CpuSet) -> Result<Scope, ControlError> {
        self.check_available(tracer)?;

        self.surface.write("tracing_on", "0")?;
        self.surface.write("current_tracer", "nop")?;
        if self.surface.exists("events/enable") {
            self.surface.write("events/enable", "0")?;
        }
        // An empty truncating write clears every CPU's ring buffer.
        self.surface.write("trace", "")?;

        if let Some(kb) = self.buffer_size_kb {
            self.set_saved("buffer_size_kb", &kb.to_string())?;
        }

        let scope = if self.global_scope {
            Scope::Global
        } else if !self.surface.exists("tracing_cpumask") {
            log::warn!(
                "No tracing_cpumask under {}, tracing all CPUs",
                self.surface.root().display()
            );
            Scope::Global
        } else {
            self.set_saved("tracing_cpumask", &cpus.to_cpumask())?;
            Scope::PerCpu(cpus.clone())
        };

        match tracer {
            TracerName::Function => {}
            TracerName::FunctionGraph => {
                self.set_saved("options/funcgraph-abstime", "1")?;
                self.set_saved("options/funcgraph-cpu", "1")?;
            }
            TracerName::Events => {
                for event in &self.events {
                    let knob = format!("events/{event}/enable");
                    self.surface.write(&knob, "1")?;
                    self.enabled_events.push(knob);
                }
            }
        }
        self.surface.write("current_tracer", tracer.kernel_tracer())?;
        self.surface.write("tracing_on", "1")?;
        Ok(scope)
    }

    fn check_available(&self, tracer: TracerName) -> Result<(), ControlError> {
        if !self.surface.exists("available_tracers") {
            return Ok(());
        }
        let available = self.surface.read("available_tracers")?;
        let wanted = tracer.kernel_tracer();
        if available.split_whitespace().any(|t| t == wanted) {
            Ok(())
        } else {
            Err(ControlError::Unsupported {
                tracer: wanted.to_owned(),
                available: available.trim().to_owned(),
            })
        }
    }

    fn set_saved(&mut self, knob: &str, value: &str) -> Result<(), ControlError> {
        let old = self.surface.read(knob)?;
        self.surface.write(knob, value)?;
        // `buffer_size_kb` reads as "7 (expanded: 1408)" until first use.
        let old = old.split_whitespace().next().unwrap_or_default();
        self.saved.push(Saved {
            knob: knob.to_owned(),
            value: old.to_owned(),
        });
        Ok(())
    }

    /// Unconditionally turn tracing off and restore saved knobs. Keeps going
    /// after a failure and reports the first one.
    fn reset(&mut self) -> Result<(), ControlError> {
        self.enabled = None;
        let mut first_err = None;
        let mut record = |result: Result<(), ControlError>| {
            if let Err(err) = result {
                log::error!("{err}");
                first_err.get_or_insert(err);
            }
        };
        record(self.surface.write("tracing_on", "0"));
        record(self.surface.write("current_tracer", "nop"));
        for knob in self.enabled_events.drain(..) {
            record(self.surface.write(&knob, "0"));
        }
        while let Some(saved) = self.saved.pop() {
            record(self.surface.write(&saved.knob, &saved.value));
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Guard for an enabled tracer. Tracing is disabled when it goes out of
/// scope, including on early returns and panics.
#[derive(Debug)]
pub struct TracingSession<'a> {
    controller: &'a mut TracerController,
}

impl TracingSession<'_> {
    pub fn run_for(&self, window: TraceWindow) -> Result<(), ControlError> {
        self.controller.run_for(window)
    }

    pub fn scope(&self) -> Scope {
        self.controller
            .enabled()
            .map_or(Scope::Global, |(_, scope)| scope.clone())
    }

    /// Disable now, surfacing any error instead of only logging it.
    pub fn finish(self) -> Result<(), ControlError> {
        self.controller.disable()
    }
}

impl Drop for TracingSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.controller.disable() {
            log::error!("Failed to disable tracing: {err}");
        }
    }
}
