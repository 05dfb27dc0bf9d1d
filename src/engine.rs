//! Runs one test case: enable, drive load for the window, disable, capture
//! and check.

use crate::capture::CaptureError;
use crate::capture::TraceCapture;
use crate::check::Checker;
use crate::check::Verdict;
use crate::config::Config;
use crate::config::ConfigError;
use crate::control::ControlError;
use crate::control::ControlSurface;
use crate::control::Scope;
use crate::control::TracerController;
use crate::load::GenError;
use crate::load::LoadGenerator;
use crate::load::StopSignal;
use crate::load::WriteSummary;
use crate::record::RecordKind;
use crate::types::CpuId;
use crate::types::CpuSet;
use crate::types::TraceWindow;
use crate::types::TracerName;
use serde_derive::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that abort a test case. Check failures are not errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Load(#[from] GenError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// One tracer, window and CPU set to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub tracer: TracerName,
    pub window: TraceWindow,
    pub cpus: CpuSet,
}

impl TestCase {
    /// For every tracer and window: one case on `default_cpu` alone and,
    /// if the configured CPUs are anything else, one case on all of them.
    pub fn enumerate(config: &Config, default_cpu: CpuId) -> Result<Vec<Self>, ConfigError> {
        let single = CpuSet::single(default_cpu);
        let multi: CpuSet = config.cpus.iter().copied().collect();
        let mut cases = Vec::new();
        for &tracer in &config.tracers {
            for &ms in &config.intervals_ms {
                let window = TraceWindow::from_millis(ms).ok_or_else(|| {
                    ConfigError::Invalid("trace windows must be longer than 0ms".to_owned())
                })?;
                cases.push(Self {
                    tracer,
                    window,
                    cpus: single.clone(),
                });
                if !multi.is_empty() && multi != single {
                    cases.push(Self {
                        tracer,
                        window,
                        cpus: multi.clone(),
                    });
                }
            }
        }
        Ok(cases)
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on CPUs {} for {}", self.tracer, self.cpus, self.window)
    }
}

/// Everything one test case produced.
#[derive(Debug, Serialize)]
pub struct CaseReport {
    pub case: TestCase,
    /// Per-CPU scoping was not in effect.
    pub global_scope: bool,
    pub records: usize,
    pub malformed: usize,
    pub annotations: usize,
    pub writes: WriteSummary,
    pub verdicts: Vec<Verdict>,
}

impl CaseReport {
    pub fn failed(&self) -> bool {
        self.verdicts.iter().any(Verdict::is_failure)
    }
}

#[derive(Debug)]
pub struct Engine {
    controller: TracerController,
    load: LoadGenerator,
    capture: TraceCapture,
    checker: Checker,
    live_file: PathBuf,
    persistent_file: Option<PathBuf>,
    max_delay: Duration,
}

impl Engine {
    pub fn new(config: &Config, max_delay: Duration) -> Self {
        let surface = ControlSurface::new(config.tracefs_root());
        let load = LoadGenerator::new(&surface, config);
        Self {
            controller: TracerController::new(surface, config),
            load,
            capture: TraceCapture::new(config),
            checker: Checker::new(config),
            live_file: config.trace_files.first().cloned().unwrap_or_default(),
            persistent_file: config.persistent_file().map(PathBuf::from),
            max_delay,
        }
    }

    /// Run `case`. Tracing is disabled again on every path out of here.
    pub fn run_case(&mut self, case: &TestCase) -> Result<CaseReport, EngineError> {
        log::info!("Running {case}");
        if case.cpus.is_empty() {
            return Err(GenError::NoCpus.into());
        }
        let stop = StopSignal::new();
        let session = self.controller.enable_session(case.tracer, &case.cpus)?;
        let scope = session.scope();
        let load = &self.load;
        let max_delay = self.max_delay;

        // Writers start only once tracing is on and are joined before it is
        // turned off.
        let (window, summary) = std::thread::scope(|s| {
            let writers = s.spawn(|| load.drive(&case.cpus, case.window, max_delay, &stop));
            let window = session.run_for(case.window);
            stop.raise();
            match writers.join() {
                Ok(summary) => (window, summary),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        });
        window?;
        let summary = summary?;
        session.finish()?;

        let capture = self.capture.clone().expecting(case.tracer);
        let live = capture.read(&self.live_file)?;
        if live.is_empty() {
            log::warn!("No records in {}", self.live_file.display());
        }
        let persistent = self
            .persistent_file
            .as_deref()
            .map(|path| capture.read(path))
            .transpose()?;
        let verdicts = self.checker.run_all(
            &live,
            persistent.as_ref(),
            &case.cpus,
            &scope,
            &summary,
        );
        Ok(CaseReport {
            case: case.clone(),
            global_scope: scope == Scope::Global,
            records: live.len(),
            malformed: live.count(RecordKind::Malformed),
            annotations: live.annotations(),
            writes: summary,
            verdicts,
        })
    }
}
