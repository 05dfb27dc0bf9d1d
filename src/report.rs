//! Rendering of case reports, as text or as JSON lines.

use crate::check::Outcome;
use crate::engine::CaseReport;
use crate::engine::EngineError;
use crate::engine::TestCase;
use std::io::Write;

/// Offending records listed per failed check in text output.
const MAX_OFFENDING: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

/// Totals over a whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde_derive::Serialize)]
pub struct Totals {
    pub cases: usize,
    pub failed: usize,
    pub errors: usize,
}

impl Totals {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

pub struct Reporter<W> {
    out: W,
    format: Format,
    totals: Totals,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, format: Format) -> Self {
        Self {
            out,
            format,
            totals: Totals::default(),
        }
    }

    pub fn case(&mut self, report: &CaseReport) -> std::io::Result<()> {
        self.totals.cases += 1;
        if report.failed() {
            self.totals.failed += 1;
        }
        match self.format {
            Format::Text => self.out.write_all(render_text(report).as_bytes()),
            Format::Json => {
                serde_json::to_writer(&mut self.out, report)?;
                writeln!(self.out)
            }
        }
    }

    /// A case that could not run to completion.
    pub fn error(&mut self, case: &TestCase, err: &EngineError) -> std::io::Result<()> {
        self.totals.cases += 1;
        self.totals.errors += 1;
        match self.format {
            Format::Text => writeln!(self.out, "== {case} ==\nERROR {err}\n"),
            Format::Json => {
                let line = serde_json::json!({ "case": case, "error": err.to_string() });
                serde_json::to_writer(&mut self.out, &line)?;
                writeln!(self.out)
            }
        }
    }

    /// Write the totals and hand them back.
    pub fn finish(mut self) -> std::io::Result<Totals> {
        let totals = self.totals;
        match self.format {
            Format::Text => writeln!(
                self.out,
                "{} cases, {} failed, {} errors",
                totals.cases, totals.failed, totals.errors
            )?,
            Format::Json => {
                serde_json::to_writer(&mut self.out, &serde_json::json!({ "totals": totals }))?;
                writeln!(self.out)?;
            }
        }
        self.out.flush()?;
        Ok(totals)
    }
}

pub fn render_text(report: &CaseReport) -> String {
    let mut text = String::new();
    // Writing to a String can't fail.
    let _ = write_text(&mut text, report);
    text
}

fn write_text(out: &mut String, report: &CaseReport) -> std::fmt::Result {
    use std::fmt::Write;

    writeln!(out, "== {} ==", report.case)?;
    writeln!(
        out,
        "records: {} ({} malformed, {} annotations){}",
        report.records,
        report.malformed,
        report.annotations,
        if report.global_scope {
            ", global scope"
        } else {
            ""
        }
    )?;
    for (cpu, writes) in &report.writes.per_cpu {
        writeln!(
            out,
            "cpu {cpu}: {} writes, {} markers{}",
            writes.writes,
            writes.markers,
            if writes.pinned { "" } else { " (unpinned)" }
        )?;
    }
    for err in &report.writes.errors {
        writeln!(out, "load error: {err}")?;
    }
    for verdict in &report.verdicts {
        writeln!(out, "{verdict}")?;
        if let Outcome::Fail { offending, .. } = &verdict.outcome {
            for record in offending.iter().take(MAX_OFFENDING) {
                writeln!(out, "    {record}")?;
            }
            if offending.len() > MAX_OFFENDING {
                writeln!(out, "    ... and {} more", offending.len() - MAX_OFFENDING)?;
            }
        }
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TraceCapture;
    use crate::check::Checker;
    use crate::config::Config;
    use crate::control::ControlError;
    use crate::control::Scope;
    use crate::load::CpuWrites;
    use crate::load::WriteSummary;
    use crate::types::CpuId;
    use crate::types::CpuSet;
    use crate::types::TraceWindow;
    use crate::types::TracerName;
    use indoc::indoc;

    fn report() -> CaseReport {
        let trace = indoc! {"
            # tracer: nop
            #
              bash-10  [000] ....   1.000001: tracing_mark_write: ftracebt-data cpu=0 seq=0
              bash-10  [000] ....   1.000002: tracing_mark_write: ftracebt-data cpu=0 seq=1
              bash-10  [000] ....   1.000003: tracing_mark_write: ftracebt-page cpu=0 page=0
              bash-11  [001] ....   1.000004: tracing_mark_write: ftracebt-data cpu=1 seq=0
              bash-11  [001] ....   1.000002: tracing_mark_write: ftracebt-data cpu=1 seq=1
        "};
        let config = Config {
            marker_entries_per_page: 4,
            ..Config::default()
        };
        let live = TraceCapture::new(&config).parse(trace.as_bytes());
        let cpus = CpuSet::single(CpuId(0));
        let mut writes = WriteSummary::default();
        writes.per_cpu.insert(
            CpuId(0),
            CpuWrites {
                writes: 2,
                markers: 1,
                pinned: true,
            },
        );
        let scope = Scope::PerCpu(cpus.clone());
        let verdicts = Checker::new(&config).run_all(&live, None, &cpus, &scope, &writes);
        CaseReport {
            case: TestCase {
                tracer: TracerName::Events,
                window: TraceWindow::from_millis(100).unwrap(),
                cpus,
            },
            global_scope: false,
            records: live.len(),
            malformed: 0,
            annotations: live.annotations(),
            writes,
            verdicts,
        }
    }

    #[test]
    fn test_text_report() {
        let rendered = render_text(&report());
        insta::assert_snapshot!(rendered, @r"
        == events on CPUs {0} for 100ms ==
        records: 5 (0 malformed, 2 annotations)
        cpu 0: 2 writes, 1 markers
        FAIL monotonic_ordering: CPU 1: timestamp goes back from 1.000004 (line 6) to 1.000002 (line 7)
            line 6 cpu 1 #0 @1.000004 data: ftracebt-data cpu=1 seq=0
            line 7 cpu 1 #1 @1.000002 data: ftracebt-data cpu=1 seq=1
        PASS no_malformed
        PASS marker_cadence
        FAIL cpu_scoping: CPU 1 is outside {0} but has 2 record(s)
            line 6 cpu 1 #0 @1.000004 data: ftracebt-data cpu=1 seq=0
        SKIP dual_file_consistency: single trace file
        PASS writes_visible
        ");
    }

    #[test]
    fn test_reporter_totals() {
        let mut out = Vec::new();
        let mut reporter = Reporter::new(&mut out, Format::Text);
        reporter.case(&report()).unwrap();
        let case = report().case;
        reporter
            .error(&case, &EngineError::Control(ControlError::NotEnabled))
            .unwrap();
        let totals = reporter.finish().unwrap();
        assert_eq!(
            totals,
            Totals {
                cases: 2,
                failed: 1,
                errors: 1,
            }
        );
        assert!(!totals.success());
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("2 cases, 1 failed, 1 errors\n"), "{text}");
    }

    #[test]
    fn test_json_lines() {
        let mut out = Vec::new();
        let mut reporter = Reporter::new(&mut out, Format::Json);
        reporter.case(&report()).unwrap();
        reporter.finish().unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["case"]["tracer"], "events");
        assert_eq!(lines[0]["case"]["window"], 100);
        assert_eq!(lines[0]["case"]["cpus"], serde_json::json!([0]));
        assert_eq!(lines[0]["verdicts"][0]["outcome"], "fail");
        assert_eq!(lines[0]["verdicts"][0]["offending"][0]["kind"], "data");
        assert_eq!(
            lines[0]["verdicts"][0]["offending"][0]["payload"]["write"],
            "ftracebt-data cpu=1 seq=0"
        );
        assert_eq!(lines[0]["writes"]["per_cpu"]["0"]["markers"], 1);
        assert_eq!(lines[1]["totals"]["failed"], 1);
    }
}
