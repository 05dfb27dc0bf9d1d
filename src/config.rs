//! Session configuration, loaded once from a TOML file and read-only after.

use crate::types::CpuId;
use crate::types::TracerName;
use regex::Regex;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use std::path::Path;
use std::path::PathBuf;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error when reading the configuration file.
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML or has unexpected keys.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The values parsed but are inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

static DEFAULT_MARKER_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(&regex::escape(DEFAULT_MARKER_TEXT)).expect("Failed to compile regex")
});

const DEFAULT_MARKER_TEXT: &str = "ftracebt-page";
const DEFAULT_WRITE_TAG: &str = "ftracebt-data";
const DEFAULT_TRACE_FILE: &str = "/sys/kernel/debug/tracing/trace";
const DEFAULT_TRACEFS: &str = "/sys/kernel/tracing";

/// Regex identifying page marker records, compiled when the config is parsed.
#[derive(Debug, Clone)]
pub struct MarkerPattern(Regex);

impl MarkerPattern {
    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for MarkerPattern {
    fn default() -> Self {
        Self(DEFAULT_MARKER_REGEX.clone())
    }
}

impl<'de> serde::Deserialize<'de> for MarkerPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = <String as serde::Deserialize>::deserialize(deserializer)?;
        Regex::new(&pattern)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Which trace file must be contained in the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// The persistent buffer is a truncated view of the live one.
    #[default]
    PersistentInLive,
    /// The live buffer is a truncated view of the persistent one.
    LiveInPersistent,
}

/// Which end of the container the contained sequence must line up with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Overlap {
    Prefix,
    Suffix,
    #[default]
    Either,
}

/// Policy for comparing a live and a persistent trace file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DualFilePolicy {
    pub direction: Direction,
    pub overlap: Overlap,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of load writes per CPU between two page markers.
    pub marker_entries_per_page: usize,
    /// Root of the tracing control surface. Defaults to the directory of
    /// the first trace file.
    pub tracefs: Option<PathBuf>,
    /// Per-CPU buffer size to set before each run, if any.
    pub buffer_size_kb: Option<u64>,
    /// Prefix of every data write issued by the load generator.
    pub write_tag: String,
    /// Prefix of every page marker issued by the load generator.
    pub marker_text: String,
    /// Payloads matching this are classified as page markers.
    pub marker_pattern: MarkerPattern,
    /// Number of malformed lines accepted before the check fails.
    pub malformed_tolerance: usize,
    /// Trace on all CPUs instead of scoping through `tracing_cpumask`.
    pub global_scope: bool,
    /// Events enabled by the `events` tracer, as `group/event` or `group`.
    pub events: Vec<String>,
    pub cpus: Vec<CpuId>,
    pub tracers: Vec<TracerName>,
    pub intervals_ms: Vec<u64>,
    /// The live trace file, optionally followed by a persistent one.
    pub trace_files: Vec<PathBuf>,
    pub dual_file: DualFilePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            marker_entries_per_page: 64,
            tracefs: None,
            buffer_size_kb: None,
            write_tag: DEFAULT_WRITE_TAG.to_owned(),
            marker_text: DEFAULT_MARKER_TEXT.to_owned(),
            marker_pattern: MarkerPattern::default(),
            malformed_tolerance: 0,
            global_scope: false,
            events: vec!["sched/sched_switch".to_owned()],
            cpus: vec![CpuId(0)],
            tracers: TracerName::ALL.to_vec(),
            intervals_ms: vec![100, 3000],
            trace_files: vec![PathBuf::from(DEFAULT_TRACE_FILE)],
            dual_file: DualFilePolicy::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency. Also called after CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.marker_entries_per_page == 0 {
            return Err(ConfigError::Invalid(
                "marker_entries_per_page must be positive".to_owned(),
            ));
        }
        if !self.marker_pattern.is_match(&self.marker_text) {
            return Err(ConfigError::Invalid(format!(
                "marker_pattern \"{}\" does not match marker_text \"{}\"",
                self.marker_pattern.as_str(),
                self.marker_text
            )));
        }
        if self.marker_pattern.is_match(&self.write_tag) {
            return Err(ConfigError::Invalid(format!(
                "marker_pattern \"{}\" also matches write_tag \"{}\"",
                self.marker_pattern.as_str(),
                self.write_tag
            )));
        }
        if self.trace_files.is_empty() || self.trace_files.len() > 2 {
            return Err(ConfigError::Invalid(format!(
                "expected one or two trace files, got {}",
                self.trace_files.len()
            )));
        }
        Ok(())
    }

    /// Root of the tracing control surface.
    pub fn tracefs_root(&self) -> PathBuf {
        if let Some(root) = &self.tracefs {
            return root.clone();
        }
        self.trace_files
            .first()
            .and_then(|file| file.parent())
            .map_or_else(|| PathBuf::from(DEFAULT_TRACEFS), Path::to_path_buf)
    }

    /// The persistent trace file, if one was configured.
    pub fn persistent_file(&self) -> Option<&Path> {
        self.trace_files.get(1).map(PathBuf::as_path)
    }
}
