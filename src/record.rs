//! Parsed trace records and the per-file sequence they form.

use crate::types::CpuId;
use crate::types::Timestamp;
use compact_str::CompactString;
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Tracer specific content of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// A `function` tracer entry: `func <-parent`.
    Function {
        function: CompactString,
        parent: Option<CompactString>,
    },
    /// A `function_graph` entry, exit or leaf call.
    Graph {
        /// Nesting depth, from the indentation of the call.
        depth: usize,
        call: String,
        duration: Option<CompactString>,
    },
    /// A trace event: `name: fields`.
    Event { name: CompactString, fields: String },
    /// Text written to `trace_marker`.
    Write(String),
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function {
                function,
                parent: Some(parent),
            } => write!(f, "{function} <-{parent}"),
            Self::Function {
                function,
                parent: None,
            } => f.write_str(function),
            Self::Graph { call, .. } => f.write_str(call),
            Self::Event { name, fields } => write!(f, "{name}: {fields}"),
            Self::Write(text) => f.write_str(text),
        }
    }
}

/// A well-formed trace line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// 1-based line number in the trace file.
    pub line: usize,
    pub cpu: CpuId,
    pub timestamp: Timestamp,
    /// Position within the CPU's own sub-stream, starting at 0.
    pub sequence_index: usize,
    /// `comm-pid` of the task, when the line format carries it.
    pub task: Option<CompactString>,
    pub payload: Payload,
}

/// A line that could not be classified or lacked a required field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedLine {
    pub line: usize,
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Data,
    PageMarker,
    Malformed,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "data",
            Self::PageMarker => "page_marker",
            Self::Malformed => "malformed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceRecord {
    Data(Event),
    PageMarker(Event),
    Malformed(MalformedLine),
}

impl TraceRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Data(_) => RecordKind::Data,
            Self::PageMarker(_) => RecordKind::PageMarker,
            Self::Malformed(_) => RecordKind::Malformed,
        }
    }

    /// The parsed event, for anything but a malformed line.
    pub fn event(&self) -> Option<&Event> {
        match self {
            Self::Data(event) | Self::PageMarker(event) => Some(event),
            Self::Malformed(_) => None,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Self::Data(event) | Self::PageMarker(event) => event.line,
            Self::Malformed(malformed) => malformed.line,
        }
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(event) | Self::PageMarker(event) => write!(
                f,
                "line {} cpu {} #{} @{} {}: {}",
                event.line,
                event.cpu,
                event.sequence_index,
                event.timestamp,
                self.kind(),
                event.payload
            ),
            Self::Malformed(malformed) => write!(
                f,
                "line {} malformed ({}): {}",
                malformed.line, malformed.reason, malformed.raw
            ),
        }
    }
}

/// All records of one trace file in file order, indexed by CPU.
#[derive(Debug, Clone, Default)]
pub struct RecordSequence {
    records: Vec<TraceRecord>,
    by_cpu: BTreeMap<CpuId, Vec<usize>>,
    annotations: usize,
}

impl RecordSequence {
    /// Build a sequence from records as they are. Sequence indices are
    /// taken from the records, not recomputed.
    #[cfg(test)]
    pub fn from_records(records: Vec<TraceRecord>) -> Self {
        let mut by_cpu: BTreeMap<CpuId, Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            if let Some(event) = record.event() {
                by_cpu.entry(event.cpu).or_default().push(idx);
            }
        }
        Self {
            records,
            by_cpu,
            annotations: 0,
        }
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of header, banner and separator lines that were skipped.
    pub fn annotations(&self) -> usize {
        self.annotations
    }

    /// CPUs that have at least one well-formed record, ascending.
    pub fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.by_cpu.keys().copied()
    }

    /// Records of one CPU in file order. Malformed lines are never part of a
    /// group.
    pub fn group(&self, cpu: CpuId) -> impl Iterator<Item = &TraceRecord> + '_ {
        self.by_cpu
            .get(&cpu)
            .into_iter()
            .flatten()
            .map(|&idx| &self.records[idx])
    }

    /// Data records of one CPU in file order.
    pub fn data(&self, cpu: CpuId) -> impl Iterator<Item = &Event> + '_ {
        self.group(cpu).filter_map(|record| match record {
            TraceRecord::Data(event) => Some(event),
            _ => None,
        })
    }

    pub fn malformed(&self) -> impl Iterator<Item = &MalformedLine> + '_ {
        self.records.iter().filter_map(|record| match record {
            TraceRecord::Malformed(malformed) => Some(malformed),
            _ => None,
        })
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.iter().filter(|r| r.kind() == kind).count()
    }
}

/// Builds a [`RecordSequence`] in a single forward pass, assigning each
/// well-formed record the next index of its CPU group.
#[derive(Debug, Default)]
pub struct SequenceBuilder {
    sequence: RecordSequence,
}

impl SequenceBuilder {
    pub fn push_data(&mut self, event: Event) {
        self.push_event(event, TraceRecord::Data);
    }

    pub fn push_marker(&mut self, event: Event) {
        self.push_event(event, TraceRecord::PageMarker);
    }

    fn push_event(&mut self, mut event: Event, wrap: fn(Event) -> TraceRecord) {
        let group = self.sequence.by_cpu.entry(event.cpu).or_default();
        event.sequence_index = group.len();
        group.push(self.sequence.records.len());
        self.sequence.records.push(wrap(event));
    }

    pub fn push_malformed(&mut self, malformed: MalformedLine) {
        self.sequence
            .records
            .push(TraceRecord::Malformed(malformed));
    }

    pub fn push_annotation(&mut self) {
        self.sequence.annotations += 1;
    }

    pub fn finish(self) -> RecordSequence {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(line: usize, cpu: u32, text: &str) -> Event {
        Event {
            line,
            cpu: CpuId(cpu),
            timestamp: Timestamp(line as u64),
            sequence_index: usize::MAX,
            task: None,
            payload: Payload::Write(text.to_owned()),
        }
    }

    #[test]
    fn test_builder_assigns_per_cpu_indices() {
        let mut builder = SequenceBuilder::default();
        builder.push_data(write(1, 0, "a"));
        builder.push_data(write(2, 1, "b"));
        builder.push_malformed(MalformedLine {
            line: 3,
            raw: "garbage".to_owned(),
            reason: "no cpu".to_owned(),
        });
        builder.push_marker(write(4, 0, "m"));
        builder.push_annotation();
        let seq = builder.finish();

        assert_eq!(seq.len(), 4);
        assert_eq!(seq.annotations(), 1);
        assert_eq!(seq.cpus().collect::<Vec<_>>(), vec![CpuId(0), CpuId(1)]);
        let cpu0: Vec<_> = seq
            .group(CpuId(0))
            .map(|r| (r.kind(), r.event().unwrap().sequence_index))
            .collect();
        assert_eq!(
            cpu0,
            vec![(RecordKind::Data, 0), (RecordKind::PageMarker, 1)]
        );
        assert_eq!(seq.data(CpuId(1)).next().unwrap().sequence_index, 0);
        assert_eq!(seq.count(RecordKind::Malformed), 1);
        assert_eq!(seq.malformed().next().unwrap().line, 3);
    }

    #[test]
    fn test_display() {
        let payload = Payload::Function {
            function: "do_sys_open".into(),
            parent: Some("__x64_sys_openat".into()),
        };
        assert_eq!(payload.to_string(), "do_sys_open <-__x64_sys_openat");
        let payload = Payload::Event {
            name: "sched_switch".into(),
            fields: "prev_comm=bash".to_owned(),
        };
        assert_eq!(payload.to_string(), "sched_switch: prev_comm=bash");

        let mut event = write(7, 2, "hello");
        event.sequence_index = 3;
        event.timestamp = Timestamp(1_500_000_000);
        assert_eq!(
            TraceRecord::Data(event).to_string(),
            "line 7 cpu 2 #3 @1.500000 data: hello"
        );
    }
}
