//! Bodies of trace event lines, shared by every grammar.

use crate::record::Payload;
use regex::Regex;

static EVENT_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z_][A-Za-z0-9_]*):(?: (?P<fields>.*))?$")
        .expect("Failed to compile regex")
});

/// Syscall events print as `sys_name(args)` and `sys_name -> ret`.
static SYSCALL_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^(?P<name>sys_[A-Za-z0-9_]+)(?P<fields>\(.*\)| -> .*)$")
        .expect("Failed to compile regex")
});

/// Events carrying text written to `trace_marker`.
const WRITE_EVENTS: &[&str] = &["tracing_mark_write", "print"];

/// Parse an event body, e.g. `sched_switch: prev_comm=bash prev_pid=1 ...`.
///
/// Writes to `trace_marker` are returned as [`Payload::Write`].
pub fn parse(body: &str) -> Option<Payload> {
    let body = body.trim_end();
    let (name, fields) = if let Some(caps) = EVENT_REGEX.captures(body) {
        (
            caps.name("name")?.as_str(),
            caps.name("fields").map_or("", |m| m.as_str()),
        )
    } else {
        let caps = SYSCALL_REGEX.captures(body)?;
        (caps.name("name")?.as_str(), caps.name("fields")?.as_str())
    };
    if WRITE_EVENTS.contains(&name) {
        return Some(Payload::Write(fields.to_owned()));
    }
    Some(Payload::Event {
        name: name.into(),
        fields: fields.to_owned(),
    })
}
