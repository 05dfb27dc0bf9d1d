//! Line grammar of the `function_graph` tracer with `funcgraph-abstime` and
//! `funcgraph-cpu` enabled (optionally `funcgraph-proc`).
//!
//! ```text
//!  3042.512360 |   1)               |  sys_open() {
//!  3042.512367 |   1)   0.177 us    |    getname();
//!  3042.512371 |   1) + 11.224 us   |  }
//!  3042.512380 |   1)   bash-2794   |               |  /* ftracebt-data cpu=1 seq=4 */
//!  3042.512390 |   1)   bash-2794    =>    <idle>-0
//!  3042.512400 |   1)    ==========> |
//! ```
//!
//! Without `funcgraph-abstime` there is no timestamp column and the line is
//! rejected; per-CPU ordering can't be checked without it.

use super::Entry;
use super::Line;
use super::event;
use crate::record::Payload;
use crate::types::CpuId;
use crate::types::Timestamp;
use compact_str::CompactString;
use regex::Regex;
use smallvec::SmallVec;

static LINE_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^\s*(?P<ts>\d+(?:\.\d+)?)\s+\|\s+(?P<cpu>\d+)\)(?P<rest>.*)$")
        .expect("Failed to compile regex")
});

static REST_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(concat!(
        r"^\s*(?:(?P<task>\S+-\d+)\s*\|)?",
        r"\s*(?P<dur>(?:[+!#*@$]\s*)?\d+(?:\.\d+)?\s+[um]s)?",
        r"\s*\|(?P<body>.*)$",
    ))
    .expect("Failed to compile regex")
});

/// Lines of the graph tracer without the absolute time column.
static NO_ABSTIME_REGEX: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"^\s*\d+\)\s").expect("Failed to compile regex"));

/// True if the line has the `CPU)` column shape of this grammar.
pub fn sniff(line: &str) -> bool {
    LINE_REGEX.is_match(line) || NO_ABSTIME_REGEX.is_match(line)
}

pub fn parse_line(line: &str) -> Result<Line, String> {
    let trimmed = line.trim();
    // Context switch separators between two `=>` lines.
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b == b'-') {
        return Ok(Line::Annotation);
    }
    let Some(caps) = LINE_REGEX.captures(line) else {
        if NO_ABSTIME_REGEX.is_match(line) {
            return Err("graph line without timestamp (funcgraph-abstime is off)".to_owned());
        }
        return Err("line does not match the function_graph trace format".to_owned());
    };
    let cpu = caps["cpu"]
        .parse::<u32>()
        .map_err(|e| format!("invalid CPU \"{}\": {e}", &caps["cpu"]))?;
    let timestamp = Timestamp::parse(&caps["ts"])
        .ok_or_else(|| format!("invalid timestamp \"{}\"", &caps["ts"]))?;
    let rest = &caps["rest"];
    if rest.contains("=>") && !rest.contains('|') {
        return Ok(Line::Annotation);
    }
    // Interrupt entry and exit (`funcgraph-irqs`).
    if rest
        .split('|')
        .any(|column| matches!(column.trim(), "==========>" | "<=========="))
    {
        return Ok(Line::Annotation);
    }
    let rest_caps = REST_REGEX
        .captures(rest)
        .ok_or_else(|| format!("missing duration/body columns in \"{rest}\""))?;
    let body = &rest_caps["body"];
    let payload = parse_body(body, rest_caps.name("dur").map(|m| m.as_str()))?;
    Ok(Line::Entry(Entry {
        cpu: CpuId(cpu),
        timestamp,
        task: rest_caps.name("task").map(|m| CompactString::from(m.as_str())),
        payload,
    }))
}

fn parse_body(body: &str, duration: Option<&str>) -> Result<Payload, String> {
    let indent = body.len() - body.trim_start().len();
    let call = body.trim();
    if let Some(comment) = call
        .strip_prefix("/*")
        .and_then(|c| c.strip_suffix("*/"))
    {
        let comment = comment.trim();
        return Ok(event::parse(comment).unwrap_or_else(|| Payload::Write(comment.to_owned())));
    }
    let is_exit = call == "}" || call.starts_with("} ");
    if !is_exit && !call.ends_with('{') && !call.ends_with(';') {
        return Err(format!("unrecognized graph body \"{call}\""));
    }
    // "+ 11.224 us" and "+  11.224 us" are the same duration.
    let duration = duration.map(|d| {
        let words: SmallVec<[&str; 3]> = d.split_whitespace().collect();
        CompactString::from(words.join(" "))
    });
    Ok(Payload::Graph {
        depth: (indent / 2).saturating_sub(1),
        call: call.to_owned(),
        duration,
    })
}
