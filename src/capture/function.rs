//! Line grammar of the `function` tracer and of plain event tracing.
//!
//! ```text
//!             bash-1977    [000] d..1. 17284.993652: do_sys_open <-do_syscall_64
//!           <idle>-0       [001] ..s1. 17284.993700: sched_switch: prev_comm=...
//!             bash-1977    (   1977) [000] .... 17284.993652: tracing_mark_write: hi
//! ```
//!
//! The TGID column and the flags column are optional (`record-tgid` and
//! `irq-info` options).

use super::Entry;
use super::event;
use crate::record::Payload;
use crate::types::CpuId;
use crate::types::Timestamp;
use compact_str::CompactString;
use regex::Regex;

static LINE_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(concat!(
        r"^\s*(?P<task>.+?-\d+)\s+",
        r"(?:\(\s*(?:\d+|-+)\)\s+)?",
        r"\[(?P<cpu>\d+)\]\s+",
        r"(?:\S{4,6}\s+)?",
        r"(?P<ts>\d+(?:\.\d+)?):\s*",
        r"(?P<body>.*)$",
    ))
    .expect("Failed to compile regex")
});

/// Functions in modules carry a ` [module]` suffix, kept as part of the name.
static FUNCTION_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<func>[^\s:\[]+(?: \[[^\]]+\])?)",
        r"(?:\s+<-(?P<parent>[^\s\[]+(?: \[[^\]]+\])?))?$",
    ))
    .expect("Failed to compile regex")
});

/// True if the line has the `[CPU]` column shape of this grammar.
pub fn sniff(line: &str) -> bool {
    LINE_REGEX.is_match(line)
}

/// Parse a line of the `function` tracer. Both function entries and events
/// are accepted, since enabled events interleave with function entries.
pub fn parse_line(line: &str) -> Result<Entry, String> {
    parse_with(line, |body| {
        event::parse(body)
            .or_else(|| parse_function(body))
            .ok_or_else(|| format!("unrecognized function body \"{body}\""))
    })
}

/// Parse a line when only events are enabled (`nop` tracer).
pub fn parse_event_line(line: &str) -> Result<Entry, String> {
    parse_with(line, |body| {
        event::parse(body).ok_or_else(|| format!("expected an event, found \"{body}\""))
    })
}

fn parse_with(
    line: &str,
    body_parser: impl FnOnce(&str) -> Result<Payload, String>,
) -> Result<Entry, String> {
    let caps = LINE_REGEX
        .captures(line)
        .ok_or_else(|| "line does not match the [CPU] trace format".to_owned())?;
    let cpu = caps["cpu"]
        .parse::<u32>()
        .map_err(|e| format!("invalid CPU \"{}\": {e}", &caps["cpu"]))?;
    let timestamp = Timestamp::parse(&caps["ts"])
        .ok_or_else(|| format!("invalid timestamp \"{}\"", &caps["ts"]))?;
    let payload = body_parser(caps["body"].trim_end())?;
    Ok(Entry {
        cpu: CpuId(cpu),
        timestamp,
        task: Some(CompactString::from(caps["task"].trim())),
        payload,
    })
}

fn parse_function(body: &str) -> Option<Payload> {
    let caps = FUNCTION_REGEX.captures(body)?;
    Some(Payload::Function {
        function: caps.name("func")?.as_str().into(),
        parent: caps.name("parent").map(|m| m.as_str().into()),
    })
}
