//! Reading trace files back into ordered, per-CPU record sequences.
//!
//! The text format depends on the tracer that produced it, so every line is
//! parsed by a [`Grammar`] chosen from the `# tracer:` header (or, failing
//! that, the tracer the caller expects, or the shape of the first data
//! line). Adding a tracer means adding a grammar variant and its module; the
//! rest of the pipeline only sees [`TraceRecord`]s.

use crate::config::Config;
use crate::config::MarkerPattern;
use crate::record::Event;
use crate::record::MalformedLine;
use crate::record::Payload;
use crate::record::RecordSequence;
use crate::record::SequenceBuilder;
use crate::types::CpuId;
use crate::types::Timestamp;
use crate::types::TracerName;
use compact_str::CompactString;
use regex::Regex;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

pub mod event;
pub mod function;
pub mod graph;

/// Error type for trace capture. All of these are fatal for a test case.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to open trace file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read trace file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The kernel always terminates lines; a missing final newline means the
    /// read was cut short.
    #[error("Trace file {path} is truncated ({len} bytes, no final newline)")]
    Truncated { path: PathBuf, len: usize },
}

/// The tracer-specific parts of a well-formed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub cpu: CpuId,
    pub timestamp: Timestamp,
    pub task: Option<CompactString>,
    pub payload: Payload,
}

/// Result of parsing one line with a grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Entry(Entry),
    /// Separator or banner lines carrying no record.
    Annotation,
}

/// Line grammars, one per tracer output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Function,
    FunctionGraph,
    Events,
}

impl Grammar {
    pub fn for_tracer(tracer: TracerName) -> Self {
        match tracer {
            TracerName::Function => Self::Function,
            TracerName::FunctionGraph => Self::FunctionGraph,
            TracerName::Events => Self::Events,
        }
    }

    /// Grammar for the name in a `# tracer: <name>` header.
    pub fn from_header(name: &str) -> Option<Self> {
        match name {
            "function" => Some(Self::Function),
            "function_graph" => Some(Self::FunctionGraph),
            "nop" => Some(Self::Events),
            _ => None,
        }
    }

    /// Guess the grammar from the fixed columns of a line.
    pub fn sniff(line: &str) -> Option<Self> {
        if graph::sniff(line) {
            Some(Self::FunctionGraph)
        } else if function::sniff(line) {
            Some(Self::Function)
        } else {
            None
        }
    }

    pub fn parse_line(self, line: &str) -> Result<Line, String> {
        match self {
            Self::Function => function::parse_line(line).map(Line::Entry),
            Self::Events => function::parse_event_line(line).map(Line::Entry),
            Self::FunctionGraph => graph::parse_line(line),
        }
    }
}

static TRACER_HEADER_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^#\s*tracer:\s*(?P<name>\S+)").expect("Failed to compile regex")
});

/// Lines the ring buffer emits on its own: `CPU:2 [LOST 1024 EVENTS]`.
static LOST_EVENTS_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^\s*CPU:(?P<cpu>\d+) \[LOST (?P<count>\d+) EVENTS\]\s*$")
        .expect("Failed to compile regex")
});

/// Parses trace files into [`RecordSequence`]s.
#[derive(Debug, Clone)]
pub struct TraceCapture {
    marker: MarkerPattern,
    expected: Option<TracerName>,
}

impl TraceCapture {
    pub fn new(config: &Config) -> Self {
        Self {
            marker: config.marker_pattern.clone(),
            expected: None,
        }
    }

    /// Use the grammar of `tracer` for files without a `# tracer:` header.
    pub fn expecting(mut self, tracer: TracerName) -> Self {
        self.expected = Some(tracer);
        self
    }

    pub fn read(&self, path: &Path) -> Result<RecordSequence, CaptureError> {
        let mut file = std::fs::File::open(path).map_err(|source| CaptureError::Open {
            path: path.to_owned(),
            source,
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|source| CaptureError::Read {
                path: path.to_owned(),
                source,
            })?;
        if data.last().is_some_and(|&b| b != b'\n') {
            return Err(CaptureError::Truncated {
                path: path.to_owned(),
                len: data.len(),
            });
        }
        let sequence = self.parse(&data);
        log::debug!(
            "Read {} records ({} annotations) from {}",
            sequence.len(),
            sequence.annotations(),
            path.display()
        );
        Ok(sequence)
    }

    /// Parse trace text in one forward pass. Never fails: lines that can't be
    /// parsed become malformed records.
    pub fn parse(&self, data: &[u8]) -> RecordSequence {
        let mut builder = SequenceBuilder::default();
        let mut grammar = self.expected.map(Grammar::for_tracer);
        let mut start = 0;
        let ends = memchr::memchr_iter(b'\n', data).chain(
            // Final line without a newline, when parsing from memory.
            (data.last().is_some_and(|&b| b != b'\n')).then_some(data.len()),
        );
        for (idx, end) in ends.enumerate() {
            let bytes = &data[start..end];
            start = end + 1;
            let line_no = idx + 1;
            let Ok(line) = std::str::from_utf8(bytes) else {
                builder.push_malformed(MalformedLine {
                    line: line_no,
                    raw: String::from_utf8_lossy(bytes).into_owned(),
                    reason: "not valid UTF-8".to_owned(),
                });
                continue;
            };
            let line = line.strip_suffix('\r').unwrap_or(line);
            if self.is_annotation(line, &mut grammar) {
                builder.push_annotation();
                continue;
            }
            let Some(active) = grammar.or_else(|| Grammar::sniff(line)) else {
                builder.push_malformed(MalformedLine {
                    line: line_no,
                    raw: line.to_owned(),
                    reason: "unable to classify line".to_owned(),
                });
                continue;
            };
            grammar = Some(active);
            match active.parse_line(line) {
                Ok(Line::Entry(entry)) => {
                    let marker = self.marker.is_match(&entry.payload.to_string());
                    let event = Event {
                        line: line_no,
                        cpu: entry.cpu,
                        timestamp: entry.timestamp,
                        sequence_index: 0,
                        task: entry.task,
                        payload: entry.payload,
                    };
                    if marker {
                        builder.push_marker(event);
                    } else {
                        builder.push_data(event);
                    }
                }
                Ok(Line::Annotation) => builder.push_annotation(),
                Err(reason) => builder.push_malformed(MalformedLine {
                    line: line_no,
                    raw: line.to_owned(),
                    reason,
                }),
            }
        }
        builder.finish()
    }

    /// Comments, blank lines, CPU banners and lost-event notices. A
    /// `# tracer:` header also selects the grammar for the following lines.
    fn is_annotation(&self, line: &str, grammar: &mut Option<Grammar>) -> bool {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return true;
        }
        if trimmed.starts_with('#') {
            if let Some(caps) = TRACER_HEADER_REGEX.captures(trimmed) {
                let name = &caps["name"];
                match Grammar::from_header(name) {
                    Some(header) => {
                        if self.expected.is_some_and(|t| Grammar::for_tracer(t) != header) {
                            log::warn!(
                                "Trace header names tracer {name}, expected {:?}; using the header",
                                self.expected
                            );
                        }
                        *grammar = Some(header);
                    }
                    None => log::warn!("Unsupported tracer \"{name}\" in trace header"),
                }
            }
            return true;
        }
        if let Some(caps) = LOST_EVENTS_REGEX.captures(trimmed) {
            log::warn!(
                "Ring buffer reports {} lost events on CPU {}",
                &caps["count"],
                &caps["cpu"]
            );
            return true;
        }
        false
    }
}
