//! Basic value types shared by every stage of the engine.

use serde_derive::Deserialize;
use serde_derive::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A kernel-visible CPU number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of CPUs. Iteration is always in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuSet(BTreeSet<CpuId>);

impl CpuSet {
    pub fn single(cpu: CpuId) -> Self {
        Self(BTreeSet::from([cpu]))
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.0.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.0.iter().copied()
    }

    /// Render the set in the format `tracing_cpumask` expects: hex words of
    /// 32 CPUs each, most significant word first, separated by commas.
    pub fn to_cpumask(&self) -> String {
        let Some(highest) = self.0.last() else {
            return "0".to_owned();
        };
        let mut words = vec![0u32; highest.0 as usize / 32 + 1];
        for cpu in &self.0 {
            words[cpu.0 as usize / 32] |= 1 << (cpu.0 % 32);
        }
        words
            .iter()
            .rev()
            .enumerate()
            .map(|(i, word)| {
                if i == 0 {
                    format!("{word:x}")
                } else {
                    format!("{word:08x}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<T: IntoIterator<Item = CpuId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, cpu) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{cpu}")?;
        }
        write!(f, "}}")
    }
}

/// Error for a tracer name we don't know how to drive.
#[derive(Debug, thiserror::Error)]
#[error("Unknown tracer: {0} (expected function, function_graph or events)")]
pub struct UnknownTracer(pub String);

/// The tracers this tool knows how to drive and parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracerName {
    Function,
    FunctionGraph,
    /// No tracer (`nop`), with a set of trace events enabled instead.
    Events,
}

impl TracerName {
    pub const ALL: [Self; 3] = [Self::Function, Self::FunctionGraph, Self::Events];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::FunctionGraph => "function_graph",
            Self::Events => "events",
        }
    }

    /// The value written to `current_tracer` for this mode.
    pub fn kernel_tracer(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::FunctionGraph => "function_graph",
            Self::Events => "nop",
        }
    }
}

impl FromStr for TracerName {
    type Err = UnknownTracer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "function" => Ok(Self::Function),
            "function_graph" => Ok(Self::FunctionGraph),
            "events" => Ok(Self::Events),
            other => Err(UnknownTracer(other.to_owned())),
        }
    }
}

impl fmt::Display for TracerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a tracer stays enabled. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceWindow(Duration);

impl TraceWindow {
    /// Returns `None` for a zero-length window.
    pub fn from_millis(ms: u64) -> Option<Self> {
        (ms > 0).then(|| Self(Duration::from_millis(ms)))
    }

    pub fn duration(self) -> Duration {
        self.0
    }
}

/// Serialized as whole milliseconds, the unit it is configured in.
impl serde::Serialize for TraceWindow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for TraceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

/// A trace timestamp in nanoseconds on the per-CPU trace clock.
///
/// Counter clocks (`trace_clock` set to `counter` or `x86-tsc`) print a bare
/// integer; that value is kept as is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

const NS_PER_S: u64 = 1_000_000_000;

impl Timestamp {
    /// Parse the `SECS.FRACTION` form printed by ftrace.
    pub fn parse(text: &str) -> Option<Self> {
        let (secs, frac) = match text.split_once('.') {
            Some((secs, frac)) => (secs, Some(frac)),
            None => (text, None),
        };
        if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let secs: u64 = secs.parse().ok()?;
        let Some(frac) = frac else {
            return Some(Self(secs));
        };
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Scale to nanoseconds; precision beyond 9 digits is dropped.
        let digits = &frac[..frac.len().min(9)];
        let scale = 10u64.pow(9 - digits.len() as u32);
        let nanos: u64 = digits.parse::<u64>().ok()? * scale;
        secs.checked_mul(NS_PER_S)?.checked_add(nanos).map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / NS_PER_S, (self.0 % NS_PER_S) / 1_000)
    }
}
