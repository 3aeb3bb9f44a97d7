//! Ready-made monitoring tools.
//!
//! | Tool | Purpose |
//! |------|---------|
//! | [`LoggingTool`] | Logs every event through the `log` facade |
//! | [`ProfilingTool`] | Event counts and call counts per code object |
//! | [`CoverageTool`] | Lines and branches reached, disabling each location after its first hit |
//! | [`RecordingTool`] | Full event recording for post-mortem comparison |
//!
//! Each tool is a [`MonitorCallback`]; register it for the events it cares
//! about with [`Monitoring::install`](super::Monitoring::install).

use std::{
    collections::BTreeSet,
    fmt,
    sync::{Mutex, PoisonError},
};

use ahash::AHashMap;

use super::{
    callback::{CallbackResult, Disposition, EventArgs, MonitorCallback, Payload},
    events::Event,
};

// ============================================================================
// LoggingTool: human-readable event log
// ============================================================================

/// Logs each event at `log::Level::Info`.
///
/// Output format:
/// ```text
/// PY_START     f @0
/// LINE         f @2 line=11
/// BRANCH_RIGHT f @6 -> 14
/// ```
#[derive(Debug, Default)]
pub struct LoggingTool {
    limit: Option<usize>,
    count: Mutex<usize>,
}

impl LoggingTool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops logging after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: Mutex::new(0),
        }
    }
}

impl MonitorCallback for LoggingTool {
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if self.limit.is_some_and(|limit| *count >= limit) {
            return Ok(Disposition::Continue);
        }
        *count += 1;
        let name = args.code.qualname();
        match (args.line, args.payload) {
            (Some(line), _) => log::info!("{:<12} {name} @{} line={line}", args.event, args.offset),
            (None, Payload::Destination(dest)) => log::info!("{:<12} {name} @{} -> {dest}", args.event, args.offset),
            (None, Payload::Exception(exc)) => log::info!("{:<12} {name} @{} {exc}", args.event, args.offset),
            _ => log::info!("{:<12} {name} @{}", args.event, args.offset),
        }
        Ok(Disposition::Continue)
    }
}

// ============================================================================
// ProfilingTool: event frequency
// ============================================================================

/// Counts events per kind and calls per code object.
#[derive(Debug, Default)]
pub struct ProfilingTool {
    counts: Mutex<ProfileCounts>,
}

#[derive(Debug, Default)]
struct ProfileCounts {
    events: AHashMap<Event, u64>,
    starts: AHashMap<String, u64>,
    total: u64,
}

/// Summary of a profiling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingReport {
    /// Per-event counts, most frequent first.
    pub event_counts: Vec<(Event, u64)>,
    /// PY_START counts per qualified name, most frequent first.
    pub starts: Vec<(String, u64)>,
    pub total_events: u64,
}

impl ProfilingTool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut event_counts: Vec<_> = counts.events.iter().map(|(&e, &n)| (e, n)).collect();
        event_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id().cmp(&b.0.id())));
        let mut starts: Vec<_> = counts.starts.iter().map(|(name, &n)| (name.clone(), n)).collect();
        starts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ProfilingReport {
            event_counts,
            starts,
            total_events: counts.total,
        }
    }
}

impl MonitorCallback for ProfilingTool {
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.events.entry(args.event).or_insert(0) += 1;
        if args.event == Event::PyStart {
            *counts.starts.entry(args.code.qualname().to_owned()).or_insert(0) += 1;
        }
        counts.total += 1;
        Ok(Disposition::Continue)
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Monitoring Profile ===")?;
        writeln!(f, "Total events: {}", self.total_events)?;
        writeln!(f)?;
        writeln!(f, "--- Event Frequency ---")?;
        for (event, count) in &self.event_counts {
            let pct = (*count as f64 / self.total_events as f64) * 100.0;
            writeln!(f, "  {:<20} {count:>10}  ({pct:>5.1}%)", event.name())?;
        }
        if !self.starts.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Calls ---")?;
            for (name, count) in &self.starts {
                writeln!(f, "  {name:<30} {count:>10}")?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// CoverageTool: lines and branches reached
// ============================================================================

/// Records which lines ran and which branch directions were taken.
///
/// Every location is disabled after its first hit, so a fully covered
/// program runs with monitoring effectively switched off.
#[derive(Debug, Default)]
pub struct CoverageTool {
    hits: Mutex<CoverageHits>,
}

#[derive(Debug, Default)]
struct CoverageHits {
    lines: AHashMap<String, BTreeSet<u32>>,
    branches: AHashMap<String, BTreeSet<(usize, usize)>>,
}

impl CoverageTool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines reached in the code object named `qualname`.
    #[must_use]
    pub fn lines(&self, qualname: &str) -> Vec<u32> {
        let hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        hits.lines.get(qualname).map(|lines| lines.iter().copied().collect()).unwrap_or_default()
    }

    /// `(source, destination)` pairs of branch directions taken in `qualname`.
    #[must_use]
    pub fn branches(&self, qualname: &str) -> Vec<(usize, usize)> {
        let hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        hits.branches
            .get(qualname)
            .map(|branches| branches.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl MonitorCallback for CoverageTool {
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let name = args.code.qualname().to_owned();
        match (args.event, args.line, args.payload) {
            (Event::Line, Some(line), _) => {
                hits.lines.entry(name).or_default().insert(line);
            }
            (Event::BranchLeft | Event::BranchRight | Event::Branch, _, Payload::Destination(dest)) => {
                hits.branches.entry(name).or_default().insert((args.offset, dest));
            }
            _ => return Ok(Disposition::Continue),
        }
        Ok(Disposition::Disable)
    }
}

// ============================================================================
// RecordingTool: full event recording
// ============================================================================

/// One delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub tool: u8,
    pub event: Event,
    pub qualname: String,
    pub offset: usize,
    pub line: Option<u32>,
    /// For jumps and branches.
    pub destination: Option<usize>,
}

/// Records every event it receives, in order.
///
/// The cheapest way to compare two runs: record both and diff the streams.
#[derive(Debug, Default)]
pub struct RecordingTool {
    events: Mutex<Vec<RecordedEvent>>,
    limit: Option<usize>,
    disable: Option<Event>,
}

impl RecordingTool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Returns DISABLE whenever it records `event`.
    #[must_use]
    pub fn disabling(event: Event) -> Self {
        Self {
            disable: Some(event),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<RecordedEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl MonitorCallback for RecordingTool {
    fn call(&self, args: &EventArgs<'_>) -> CallbackResult {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if self.limit.is_some_and(|limit| events.len() >= limit) {
            return Ok(Disposition::Continue);
        }
        events.push(RecordedEvent {
            tool: args.tool,
            event: args.event,
            qualname: args.code.qualname().to_owned(),
            offset: args.offset,
            line: args.line,
            destination: match args.payload {
                Payload::Destination(dest) => Some(dest),
                _ => None,
            },
        });
        if self.disable == Some(args.event) {
            return Ok(Disposition::Disable);
        }
        Ok(Disposition::Continue)
    }
}
