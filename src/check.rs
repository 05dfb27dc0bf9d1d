//! Invariant checks over captured record sequences.
//!
//! Every check is a pure function of its inputs and returns a [`Verdict`].
//! A failed verdict is a finding, not an error.

use crate::config::Config;
use crate::config::Direction;
use crate::config::DualFilePolicy;
use crate::config::Overlap;
use crate::control::Scope;
use crate::load::WriteSummary;
use crate::record::Event;
use crate::record::Payload;
use crate::record::RecordKind;
use crate::record::RecordSequence;
use crate::record::TraceRecord;
use crate::types::CpuId;
use crate::types::CpuSet;
use serde_derive::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    MonotonicOrdering,
    NoMalformed,
    MarkerCadence,
    CpuScoping,
    DualFileConsistency,
    WritesVisible,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MonotonicOrdering => "monotonic_ordering",
            Self::NoMalformed => "no_malformed",
            Self::MarkerCadence => "marker_cadence",
            Self::CpuScoping => "cpu_scoping",
            Self::DualFileConsistency => "dual_file_consistency",
            Self::WritesVisible => "writes_visible",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Skipped {
        reason: String,
    },
    Fail {
        explanation: String,
        offending: Vec<TraceRecord>,
    },
}

/// The result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub check: CheckName,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Verdict {
    fn pass(check: CheckName) -> Self {
        Self {
            check,
            outcome: Outcome::Pass,
        }
    }

    fn skipped(check: CheckName, reason: impl Into<String>) -> Self {
        Self {
            check,
            outcome: Outcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    /// Pass if there are no findings, otherwise fail with all of them.
    fn from_findings(check: CheckName, findings: Vec<Finding>) -> Self {
        if findings.is_empty() {
            return Self::pass(check);
        }
        let explanation = findings
            .iter()
            .map(|f| f.explanation.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let offending = findings.into_iter().flat_map(|f| f.offending).collect();
        Self {
            check,
            outcome: Outcome::Fail {
                explanation,
                offending,
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Fail { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Pass => write!(f, "PASS {}", self.check),
            Outcome::Skipped { reason } => write!(f, "SKIP {}: {reason}", self.check),
            Outcome::Fail { explanation, .. } => {
                write!(f, "FAIL {}: {explanation}", self.check)
            }
        }
    }
}

/// One violation found by a check.
#[derive(Debug)]
struct Finding {
    explanation: String,
    offending: Vec<TraceRecord>,
}

impl Finding {
    fn new(explanation: String, offending: impl IntoIterator<Item = TraceRecord>) -> Self {
        Self {
            explanation,
            offending: offending.into_iter().collect(),
        }
    }
}

/// Runs the checks with the thresholds of one configuration.
#[derive(Debug, Clone)]
pub struct Checker {
    entries_per_page: usize,
    malformed_tolerance: usize,
    write_tag: String,
    dual_file: DualFilePolicy,
}

impl Checker {
    pub fn new(config: &Config) -> Self {
        Self {
            entries_per_page: config.marker_entries_per_page,
            malformed_tolerance: config.malformed_tolerance,
            write_tag: config.write_tag.clone(),
            dual_file: config.dual_file,
        }
    }

    /// Run every check. One failing check never prevents the others from
    /// running.
    pub fn run_all(
        &self,
        live: &RecordSequence,
        persistent: Option<&RecordSequence>,
        cpus: &CpuSet,
        scope: &Scope,
        summary: &WriteSummary,
    ) -> Vec<Verdict> {
        vec![
            self.monotonic_ordering(live),
            self.no_malformed(live),
            self.marker_cadence(live),
            self.cpu_scoping(live, cpus, scope),
            self.dual_file_consistency(live, persistent),
            self.writes_visible(live, summary),
        ]
    }

    /// In every CPU group, sequence indices count up from 0 without gaps
    /// and timestamps never go backwards. Every violation is reported.
    pub fn monotonic_ordering(&self, seq: &RecordSequence) -> Verdict {
        let mut findings = Vec::new();
        for cpu in seq.cpus() {
            let mut prev: Option<&Event> = None;
            for event in seq.group(cpu).filter_map(TraceRecord::event) {
                let expected = prev.map_or(0, |p| p.sequence_index + 1);
                if event.sequence_index != expected {
                    findings.push(Finding::new(
                        format!(
                            "CPU {cpu}: line {} has sequence index {}, expected {expected}",
                            event.line, event.sequence_index
                        ),
                        [record_of(seq, event)],
                    ));
                }
                if let Some(prev) = prev.filter(|p| event.timestamp < p.timestamp) {
                    findings.push(Finding::new(
                        format!(
                            "CPU {cpu}: timestamp goes back from {} (line {}) to {} (line {})",
                            prev.timestamp, prev.line, event.timestamp, event.line
                        ),
                        [record_of(seq, prev), record_of(seq, event)],
                    ));
                }
                prev = Some(event);
            }
        }
        Verdict::from_findings(CheckName::MonotonicOrdering, findings)
    }

    pub fn no_malformed(&self, seq: &RecordSequence) -> Verdict {
        let count = seq.count(RecordKind::Malformed);
        if count <= self.malformed_tolerance {
            return Verdict::pass(CheckName::NoMalformed);
        }
        let offending = seq.malformed().cloned().map(TraceRecord::Malformed);
        Verdict::from_findings(
            CheckName::NoMalformed,
            vec![Finding::new(
                format!(
                    "{count} malformed line(s), tolerance is {}",
                    self.malformed_tolerance
                ),
                offending,
            )],
        )
    }

    /// Counts load writes between page markers. Older pages may have been
    /// overwritten, so the first segment may hold up to a full page; the
    /// last one is a partially filled page.
    ///
    /// Only entries the writer of this CPU produced are counted, so writes of
    /// an unpinned writer that landed here don't break the cadence.
    pub fn marker_cadence(&self, seq: &RecordSequence) -> Verdict {
        let n = self.entries_per_page;
        let mut findings = Vec::new();
        for cpu in seq.cpus() {
            let mut writes = 0;
            let mut last_marker: Option<&TraceRecord> = None;
            for record in seq.group(cpu) {
                match record {
                    TraceRecord::Data(event) if self.is_load_write(cpu, event) => writes += 1,
                    TraceRecord::PageMarker(marker) if written_for(cpu, marker) => {
                        let expected = match last_marker {
                            None if writes > n => Some(format!("at most {n}")),
                            Some(_) if writes != n => Some(format!("exactly {n}")),
                            _ => None,
                        };
                        if let Some(expected) = expected {
                            findings.push(Finding::new(
                                format!(
                                    "CPU {cpu}: {writes} writes before the marker at line {}, expected {expected}",
                                    marker.line
                                ),
                                last_marker.into_iter().chain([record]).cloned(),
                            ));
                        }
                        writes = 0;
                        last_marker = Some(record);
                    }
                    _ => {}
                }
            }
            if writes >= n {
                let after = last_marker.map_or_else(
                    || "with no marker".to_owned(),
                    |m| format!("after the marker at line {}", m.line()),
                );
                findings.push(Finding::new(
                    format!("CPU {cpu}: {writes} writes {after}, expected fewer than {n}"),
                    last_marker.cloned(),
                ));
            }
        }
        Verdict::from_findings(CheckName::MarkerCadence, findings)
    }

    /// Every CPU seen in the trace is one the test asked for.
    pub fn cpu_scoping(&self, seq: &RecordSequence, cpus: &CpuSet, scope: &Scope) -> Verdict {
        if *scope == Scope::Global {
            return Verdict::skipped(CheckName::CpuScoping, "tracing on all CPUs");
        }
        let findings = seq
            .cpus()
            .filter(|&cpu| !cpus.contains(cpu))
            .map(|cpu| {
                let records = seq.group(cpu).count();
                Finding::new(
                    format!("CPU {cpu} is outside {cpus} but has {records} record(s)"),
                    seq.group(cpu).next().cloned(),
                )
            })
            .collect();
        Verdict::from_findings(CheckName::CpuScoping, findings)
    }

    /// Per CPU, the data of one file must line up with the start or the end
    /// of the other, as configured.
    pub fn dual_file_consistency(
        &self,
        live: &RecordSequence,
        persistent: Option<&RecordSequence>,
    ) -> Verdict {
        let Some(persistent) = persistent else {
            return Verdict::skipped(CheckName::DualFileConsistency, "single trace file");
        };
        let (contained, container) = match self.dual_file.direction {
            Direction::PersistentInLive => (("persistent", persistent), ("live", live)),
            Direction::LiveInPersistent => (("live", live), ("persistent", persistent)),
        };
        let mut findings = Vec::new();
        for cpu in contained.1.cpus() {
            let inner: Vec<&Event> = contained.1.data(cpu).collect();
            let outer: Vec<&Event> = container.1.data(cpu).collect();
            if inner.is_empty() || self.contains(&outer, &inner) {
                continue;
            }
            findings.push(mismatch(cpu, contained.0, &inner, container.0, &outer));
        }
        Verdict::from_findings(CheckName::DualFileConsistency, findings)
    }

    /// Every CPU the load generator wrote on shows at least one of the
    /// writes. Writers that could not be pinned are not attributed.
    pub fn writes_visible(&self, seq: &RecordSequence, summary: &WriteSummary) -> Verdict {
        if summary.total_writes() == 0 {
            return Verdict::skipped(CheckName::WritesVisible, "no writes were attempted");
        }
        let findings = summary
            .per_cpu
            .iter()
            .filter(|(_, w)| w.pinned && w.writes > 0)
            .filter(|&(&cpu, _)| !seq.data(cpu).any(|e| self.is_load_write(cpu, e)))
            .map(|(cpu, w)| {
                Finding::new(
                    format!("CPU {cpu}: none of {} writes reached the trace", w.writes),
                    Vec::new(),
                )
            })
            .collect();
        Verdict::from_findings(CheckName::WritesVisible, findings)
    }

    /// A load generator write made by the writer of `cpu`.
    fn is_load_write(&self, cpu: CpuId, event: &Event) -> bool {
        matches!(&event.payload, Payload::Write(text) if text.starts_with(&self.write_tag))
            && written_for(cpu, event)
    }

    fn contains(&self, outer: &[&Event], inner: &[&Event]) -> bool {
        let same = |a: &[&Event], b: &[&Event]| {
            a.iter().zip(b).all(|(x, y)| x.payload == y.payload)
        };
        if inner.len() > outer.len() {
            return false;
        }
        let prefix = || same(&outer[..inner.len()], inner);
        let suffix = || same(&outer[outer.len() - inner.len()..], inner);
        match self.dual_file.overlap {
            Overlap::Prefix => prefix(),
            Overlap::Suffix => suffix(),
            Overlap::Either => prefix() || suffix(),
        }
    }
}

/// Explain why `inner` is not part of `outer`: align both on the first
/// element of `inner` and report the first difference.
fn mismatch(
    cpu: CpuId,
    inner_name: &str,
    inner: &[&Event],
    outer_name: &str,
    outer: &[&Event],
) -> Finding {
    let first = inner[0];
    let Some(start) = outer.iter().position(|e| e.payload == first.payload) else {
        return Finding::new(
            format!(
                "CPU {cpu}: {inner_name} line {} `{}` does not appear in the {outer_name} trace",
                first.line, first.payload
            ),
            [TraceRecord::Data(first.clone())],
        );
    };
    for (offset, found) in inner.iter().enumerate() {
        match outer.get(start + offset) {
            Some(expected) if expected.payload == found.payload => {}
            Some(expected) => {
                return Finding::new(
                    format!(
                        "CPU {cpu}: {inner_name} line {} has `{}` where {outer_name} line {} has `{}`",
                        found.line, found.payload, expected.line, expected.payload
                    ),
                    [
                        TraceRecord::Data((*found).clone()),
                        TraceRecord::Data((*expected).clone()),
                    ],
                );
            }
            None => {
                return Finding::new(
                    format!(
                        "CPU {cpu}: {inner_name} line {} `{}` is past the end of the {outer_name} trace",
                        found.line, found.payload
                    ),
                    [TraceRecord::Data((*found).clone())],
                );
            }
        }
    }
    // Same elements, but not at the end the overlap policy requires.
    Finding::new(
        format!(
            "CPU {cpu}: {inner_name} data matches {outer_name} data from line {} on, not at a permitted end",
            outer[start].line
        ),
        [TraceRecord::Data(first.clone())],
    )
}

/// Load entries carry their writer's CPU as `cpu=<c>`. Untagged entries are
/// taken to belong to the CPU they were recorded on.
fn written_for(cpu: CpuId, event: &Event) -> bool {
    let Payload::Write(text) = &event.payload else {
        return true;
    };
    text.split_whitespace()
        .find_map(|word| word.strip_prefix("cpu="))
        .and_then(|tag| tag.parse::<u32>().ok())
        .is_none_or(|tagged| CpuId(tagged) == cpu)
}

/// The record holding `event`, for diagnostics.
fn record_of(seq: &RecordSequence, event: &Event) -> TraceRecord {
    seq.records()
        .iter()
        .find(|r| r.line() == event.line && r.event().is_some())
        .cloned()
        .unwrap_or_else(|| TraceRecord::Data(event.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TraceCapture;
    use crate::load::CpuWrites;
    use crate::record::SequenceBuilder;
    use crate::types::Timestamp;
    use indoc::indoc;

    fn checker(config: Config) -> Checker {
        Checker::new(&config)
    }

    fn parse(text: &str) -> RecordSequence {
        TraceCapture::new(&Config::default()).parse(text.as_bytes())
    }

    /// Builds per-CPU load traces line by line.
    #[derive(Default)]
    struct Trace {
        builder: SequenceBuilder,
        line: usize,
        seq: u64,
    }

    impl Trace {
        fn event(&mut self, cpu: u32, payload: Payload) -> Event {
            self.line += 1;
            Event {
                line: self.line,
                cpu: CpuId(cpu),
                timestamp: Timestamp(self.line as u64 * 1000),
                sequence_index: 0,
                task: None,
                payload,
            }
        }

        fn writes(mut self, cpu: u32, count: usize) -> Self {
            for _ in 0..count {
                let text = format!("ftracebt-data cpu={cpu} seq={}", self.seq);
                self.seq += 1;
                let event = self.event(cpu, Payload::Write(text));
                self.builder.push_data(event);
            }
            self
        }

        fn marker(mut self, cpu: u32) -> Self {
            let event = self.event(cpu, Payload::Write(format!("ftracebt-page cpu={cpu}")));
            self.builder.push_marker(event);
            self
        }

        fn finish(self) -> RecordSequence {
            self.builder.finish()
        }
    }

    fn cadence_checker() -> Checker {
        checker(Config {
            marker_entries_per_page: 4,
            ..Config::default()
        })
    }

    fn failure(verdict: &Verdict) -> (&str, &[TraceRecord]) {
        match &verdict.outcome {
            Outcome::Fail {
                explanation,
                offending,
            } => (explanation, offending),
            other => panic!("expected {} to fail, got {other:?}", verdict.check),
        }
    }

    #[test]
    fn test_cadence_full_pages_and_partial_tail() {
        let seq = Trace::default()
            .writes(0, 4)
            .marker(0)
            .writes(0, 4)
            .marker(0)
            .writes(0, 3)
            .finish();
        assert_eq!(cadence_checker().marker_cadence(&seq).outcome, Outcome::Pass);
    }

    #[test]
    fn test_cadence_missing_marker() {
        let seq = Trace::default()
            .writes(0, 4)
            .marker(0)
            .writes(0, 4)
            .writes(0, 3)
            .finish();
        let verdict = cadence_checker().marker_cadence(&seq);
        let (explanation, offending) = failure(&verdict);
        assert!(explanation.contains("7 writes after the marker at line 5"), "{explanation}");
        assert_eq!(offending[0].kind(), RecordKind::PageMarker);
    }

    #[test]
    fn test_cadence_segments() {
        // Wraparound may cut the first page short.
        let seq = Trace::default()
            .writes(0, 2)
            .marker(0)
            .writes(0, 4)
            .marker(0)
            .finish();
        assert_eq!(cadence_checker().marker_cadence(&seq).outcome, Outcome::Pass);

        // A short page in the middle.
        let seq = Trace::default()
            .writes(0, 4)
            .marker(0)
            .writes(0, 3)
            .marker(0)
            .finish();
        let verdict = cadence_checker().marker_cadence(&seq);
        let (explanation, offending) = failure(&verdict);
        assert!(explanation.contains("3 writes before the marker at line 9, expected exactly 4"));
        assert_eq!(offending.len(), 2);

        // Too many writes before the first marker.
        let seq = Trace::default().writes(0, 5).marker(0).finish();
        let verdict = cadence_checker().marker_cadence(&seq);
        let (explanation, _) = failure(&verdict);
        assert!(explanation.contains("expected at most 4"), "{explanation}");

        // No marker at all.
        let seq = Trace::default().writes(0, 3).finish();
        assert!(!cadence_checker().marker_cadence(&seq).is_failure());
        let seq = Trace::default().writes(0, 4).finish();
        let verdict = cadence_checker().marker_cadence(&seq);
        let (explanation, _) = failure(&verdict);
        assert!(explanation.contains("with no marker"), "{explanation}");
    }

    #[test]
    fn test_cadence_per_cpu() {
        // Interleaved CPUs are counted separately; CPU 1 is the broken one.
        let seq = Trace::default()
            .writes(0, 2)
            .writes(1, 3)
            .writes(0, 2)
            .marker(0)
            .writes(1, 3)
            .marker(1)
            .finish();
        let verdict = cadence_checker().marker_cadence(&seq);
        let (explanation, _) = failure(&verdict);
        assert!(explanation.starts_with("CPU 1: 6 writes"), "{explanation}");
    }

    #[test]
    fn test_cadence_ignores_other_writers() {
        // CPU 1's writer was not pinned and two of its writes landed on CPU 0.
        let text = indoc! {"
            # tracer: nop
            #
                bash-10  [000] ....   1.000001: tracing_mark_write: ftracebt-data cpu=0 seq=0
                bash-11  [000] ....   1.000002: tracing_mark_write: ftracebt-data cpu=1 seq=0
                bash-10  [000] ....   1.000003: tracing_mark_write: ftracebt-data cpu=0 seq=1
                bash-11  [000] ....   1.000004: tracing_mark_write: ftracebt-data cpu=1 seq=1
                bash-11  [000] ....   1.000005: tracing_mark_write: ftracebt-page cpu=1 page=0
                bash-10  [000] ....   1.000006: tracing_mark_write: ftracebt-page cpu=0 page=0
                bash-10  [000] ....   1.000007: tracing_mark_write: ftracebt-data cpu=0 seq=2
        "};
        let checker = checker(Config {
            marker_entries_per_page: 2,
            ..Config::default()
        });
        let seq = parse(text);
        assert_eq!(checker.marker_cadence(&seq).outcome, Outcome::Pass);

        // CPU 0's writer counts as visible only through its own writes.
        let mut summary = WriteSummary::default();
        summary.per_cpu.insert(
            CpuId(0),
            CpuWrites {
                writes: 3,
                markers: 1,
                pinned: true,
            },
        );
        assert_eq!(checker.writes_visible(&seq, &summary).outcome, Outcome::Pass);
        let strays = indoc! {"
                bash-11  [000] ....   1.000002: tracing_mark_write: ftracebt-data cpu=1 seq=0
                bash-11  [000] ....   1.000004: tracing_mark_write: ftracebt-data cpu=1 seq=1
        "};
        let verdict = checker.writes_visible(&parse(strays), &summary);
        assert_eq!(
            failure(&verdict).0,
            "CPU 0: none of 3 writes reached the trace"
        );
    }

    #[test]
    fn test_cadence_reports_every_bad_page() {
        let seq = Trace::default()
            .writes(0, 4)
            .marker(0)
            .writes(0, 3)
            .marker(0)
            .writes(0, 5)
            .marker(0)
            .writes(0, 4)
            .finish();
        let verdict = cadence_checker().marker_cadence(&seq);
        let (explanation, offending) = failure(&verdict);
        assert_eq!(
            explanation,
            "CPU 0: 3 writes before the marker at line 9, expected exactly 4; \
             CPU 0: 5 writes before the marker at line 15, expected exactly 4; \
             CPU 0: 4 writes after the marker at line 15, expected fewer than 4"
        );
        assert_eq!(offending.len(), 5);
    }

    #[test]
    fn test_cadence_ignores_other_data() {
        let text = indoc! {"
            # tracer: function
            #
                bash-10  [000] ....   1.000001: tracing_mark_write: ftracebt-data cpu=0 seq=0
                bash-10  [000] ....   1.000002: do_sys_open <-do_syscall_64
                bash-10  [000] ....   1.000003: tracing_mark_write: someone else
                bash-10  [000] ....   1.000004: tracing_mark_write: ftracebt-data cpu=0 seq=1
                bash-10  [000] ....   1.000005: tracing_mark_write: ftracebt-page cpu=0 page=0
        "};
        let checker = checker(Config {
            marker_entries_per_page: 2,
            ..Config::default()
        });
        assert_eq!(checker.marker_cadence(&parse(text)).outcome, Outcome::Pass);
    }

    #[test]
    fn test_monotonic_ordering() {
        let text = indoc! {"
              bash-10  [000] ....   1.000001: tracing_mark_write: a
              bash-11  [001] ....   0.500000: tracing_mark_write: b
              bash-10  [000] ....   1.000001: tracing_mark_write: c
              bash-10  [000] ....   1.000002: tracing_mark_write: d
        "};
        let checker = checker(Config::default());
        // Equal timestamps and cross-CPU order don't matter.
        assert_eq!(checker.monotonic_ordering(&parse(text)).outcome, Outcome::Pass);

        let text = indoc! {"
              bash-10  [000] ....   1.000002: tracing_mark_write: a
              bash-10  [000] ....   1.000001: tracing_mark_write: b
        "};
        let verdict = checker.monotonic_ordering(&parse(text));
        let (explanation, offending) = failure(&verdict);
        assert_eq!(
            explanation,
            "CPU 0: timestamp goes back from 1.000002 (line 1) to 1.000001 (line 2)"
        );
        assert_eq!(offending.len(), 2);
        assert_eq!(offending[1].line(), 2);

        let text = indoc! {"
              bash-10  [000] ....   1.000005: tracing_mark_write: a
              bash-10  [000] ....   1.000004: tracing_mark_write: b
              bash-10  [000] ....   1.000006: tracing_mark_write: c
              bash-10  [000] ....   1.000001: tracing_mark_write: d
        "};
        let verdict = checker.monotonic_ordering(&parse(text));
        let (explanation, offending) = failure(&verdict);
        assert_eq!(
            explanation,
            "CPU 0: timestamp goes back from 1.000005 (line 1) to 1.000004 (line 2); \
             CPU 0: timestamp goes back from 1.000006 (line 3) to 1.000001 (line 4)"
        );
        assert_eq!(offending.len(), 4);
    }

    #[test]
    fn test_monotonic_sequence_gap() {
        let event = |line, sequence_index| Event {
            line,
            cpu: CpuId(2),
            timestamp: Timestamp(line as u64),
            sequence_index,
            task: None,
            payload: Payload::Write("x".to_owned()),
        };
        let seq = RecordSequence::from_records(vec![
            TraceRecord::Data(event(1, 0)),
            TraceRecord::Data(event(2, 2)),
        ]);
        let verdict = checker(Config::default()).monotonic_ordering(&seq);
        let (explanation, _) = failure(&verdict);
        assert_eq!(explanation, "CPU 2: line 2 has sequence index 2, expected 1");
    }

    #[test]
    fn test_malformed_tolerance() {
        let text = indoc! {"
              bash-10  [000] ....   1.000001: tracing_mark_write: a
              bash-10  [000] .... garbage
        "};
        let seq = parse(text);
        let strict = checker(Config::default()).no_malformed(&seq);
        let (explanation, offending) = failure(&strict);
        assert_eq!(explanation, "1 malformed line(s), tolerance is 0");
        assert_eq!(offending[0].line(), 2);

        let lenient = checker(Config {
            malformed_tolerance: 1,
            ..Config::default()
        });
        assert_eq!(lenient.no_malformed(&seq).outcome, Outcome::Pass);
    }

    #[test]
    fn test_cpu_scoping() {
        let text = indoc! {"
              bash-10  [000] ....   1.000001: tracing_mark_write: a
              bash-12  [002] ....   1.000002: tracing_mark_write: b
              bash-12  [002] ....   1.000003: tracing_mark_write: c
        "};
        let seq = parse(text);
        let cpus: CpuSet = [CpuId(0), CpuId(1)].into_iter().collect();
        let checker = checker(Config::default());

        let verdict = checker.cpu_scoping(&seq, &cpus, &Scope::PerCpu(cpus.clone()));
        let (explanation, offending) = failure(&verdict);
        assert_eq!(explanation, "CPU 2 is outside {0,1} but has 2 record(s)");
        assert_eq!(offending[0].line(), 2);

        let verdict = checker.cpu_scoping(&seq, &cpus, &Scope::Global);
        assert!(matches!(verdict.outcome, Outcome::Skipped { .. }));
    }

    const LIVE: &str = indoc! {"
        # tracer: nop
          bash-10  [000] ....   1.000001: tracing_mark_write: a
          bash-10  [000] ....   1.000002: tracing_mark_write: b
          bash-10  [000] ....   1.000003: tracing_mark_write: c
          bash-10  [000] ....   1.000004: tracing_mark_write: d
    "};

    #[test]
    fn test_dual_file_suffix() {
        let persistent = indoc! {"
            # tracer: nop
              bash-10  [000] ....   1.000002: tracing_mark_write: b
              bash-10  [000] ....   1.000003: tracing_mark_write: c
              bash-10  [000] ....   1.000004: tracing_mark_write: d
        "};
        let checker = checker(Config::default());
        let verdict = checker.dual_file_consistency(&parse(LIVE), Some(&parse(persistent)));
        assert_eq!(verdict.outcome, Outcome::Pass);

        let prefix_only = Checker {
            dual_file: DualFilePolicy {
                direction: Direction::PersistentInLive,
                overlap: Overlap::Prefix,
            },
            ..checker
        };
        let verdict = prefix_only.dual_file_consistency(&parse(LIVE), Some(&parse(persistent)));
        let (explanation, _) = failure(&verdict);
        assert!(explanation.contains("not at a permitted end"), "{explanation}");
    }

    #[test]
    fn test_dual_file_mismatch() {
        let persistent = indoc! {"
            # tracer: nop
              bash-10  [000] ....   1.000002: tracing_mark_write: b
              bash-10  [000] ....   1.000003: tracing_mark_write: x
              bash-10  [000] ....   1.000004: tracing_mark_write: d
        "};
        let checker = checker(Config::default());
        let verdict = checker.dual_file_consistency(&parse(LIVE), Some(&parse(persistent)));
        let (explanation, offending) = failure(&verdict);
        assert_eq!(
            explanation,
            "CPU 0: persistent line 3 has `x` where live line 4 has `c`"
        );
        assert_eq!(offending.len(), 2);

        // The other way round, the longer live trace can't fit.
        let reversed = Checker {
            dual_file: DualFilePolicy {
                direction: Direction::LiveInPersistent,
                overlap: Overlap::Either,
            },
            ..checker.clone()
        };
        let verdict = reversed.dual_file_consistency(&parse(LIVE), Some(&parse(persistent)));
        let (explanation, _) = failure(&verdict);
        assert_eq!(
            explanation,
            "CPU 0: live line 2 `a` does not appear in the persistent trace"
        );

        let verdict = checker.dual_file_consistency(&parse(LIVE), None);
        assert!(matches!(verdict.outcome, Outcome::Skipped { .. }));
    }

    #[test]
    fn test_writes_visible() {
        let seq = Trace::default().writes(0, 2).finish();
        let mut summary = WriteSummary::default();
        let checker = checker(Config::default());
        assert!(matches!(
            checker.writes_visible(&seq, &summary).outcome,
            Outcome::Skipped { .. }
        ));

        let wrote = CpuWrites {
            writes: 10,
            markers: 0,
            pinned: true,
        };
        summary.per_cpu.insert(CpuId(0), wrote);
        assert_eq!(checker.writes_visible(&seq, &summary).outcome, Outcome::Pass);

        summary.per_cpu.insert(CpuId(1), wrote);
        let verdict = checker.writes_visible(&seq, &summary);
        assert_eq!(
            failure(&verdict).0,
            "CPU 1: none of 10 writes reached the trace"
        );

        // Unpinned writers may have landed anywhere.
        summary.per_cpu.insert(
            CpuId(1),
            CpuWrites {
                pinned: false,
                ..wrote
            },
        );
        assert_eq!(checker.writes_visible(&seq, &summary).outcome, Outcome::Pass);
    }

    #[test]
    fn test_run_all_reports_every_failure() {
        let text = indoc! {"
              bash-10  [000] ....   1.000001: tracing_mark_write: ftracebt-data cpu=0 seq=0
              bash-10  [003] .... broken
              bash-12  [002] ....   1.000002: tracing_mark_write: ftracebt-data cpu=2 seq=0
        "};
        let cpus = CpuSet::single(CpuId(0));
        let verdicts = checker(Config::default()).run_all(
            &parse(text),
            None,
            &cpus,
            &Scope::PerCpu(cpus.clone()),
            &WriteSummary::default(),
        );
        let failed: Vec<_> = verdicts
            .iter()
            .filter(|v| v.is_failure())
            .map(|v| v.check)
            .collect();
        assert_eq!(failed, [CheckName::NoMalformed, CheckName::CpuScoping]);
        assert_eq!(verdicts.len(), 6);
    }

    #[test]
    fn test_verdict_json() {
        let verdict = Verdict::skipped(CheckName::DualFileConsistency, "single trace file");
        assert_eq!(
            serde_json::to_string(&verdict).unwrap(),
            r#"{"check":"dual_file_consistency","outcome":"skipped","reason":"single trace file"}"#
        );
        assert_eq!(verdict.to_string(), "SKIP dual_file_consistency: single trace file");
    }
}
