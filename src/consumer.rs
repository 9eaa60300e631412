//! # Gap-Tracking Event Consumer
//!
//! Tracks, per event store, which identifier ranges have already been
//! delivered to a projection, and retries the holes that out-of-order
//! commits leave behind.
//!
//! ## The Range List
//!
//! The consumer's whole state is a sorted, disjoint list of half-open
//! ranges: identifiers still awaiting delivery. Everything below the first
//! range's `begin` is confirmed delivered; the final range is unbounded and
//! covers identifiers not seen yet.
//!
//! ```text
//! delivered        gap          delivered      gap      not seen yet
//! ────────────┤[12,      14)├──────────────┤[19, 20)├┤[23,          ...)
//!             └ begin_event_id() == 12: safe resume point
//! ```
//!
//! Consuming an identifier either advances its range's `begin` (when it is
//! the lower bound) or splits the range around it (when it is interior,
//! leaving a gap below and above). A range that becomes empty is a fully
//! closed gap and is dropped.
//!
//! ## Bounded Memory
//!
//! An aborted transaction's reserved identifier never appears, so its gap
//! would be retried forever. Two eviction policies bound this, both
//! deliberately lossy: a dropped gap is *permanently skipped*, not retried.
//!
//! - **Window**: at most [`ConsumerConfig::window`] tracked ranges; the
//!   lowest gaps beyond the window are dropped.
//! - **Age**: gaps older than [`ConsumerConfig::gap_timeout`] are dropped.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::db::Transaction;
use crate::error::{Error, Result};
use crate::events::{EventRecord, EventStore};
use crate::types::{EventId, EventRange};

// =============================================================================
// Configuration
// =============================================================================

/// Eviction policy bounds for one consumer.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Maximum number of tracked ranges before the lowest gaps are dropped.
    pub window: usize,
    /// Maximum age of a tracked gap before it stops being retried.
    pub gap_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            window: 5000,
            gap_timeout: Duration::from_secs(5 * 60),
        }
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// One tracked range plus the time it became a gap.
#[derive(Debug, Clone, Copy)]
struct TrackedRange {
    range: EventRange,
    since: Instant,
}

struct ConsumerState {
    ranges: Vec<TrackedRange>,
}

/// Delivery bookkeeping for one event store.
///
/// The range list lives behind a mutex and is only mutated inside
/// [`EventConsumer::consume`]; a single manager invokes `consume` serially
/// from its own loop, so the lock is uncontended in practice.
pub struct EventConsumer<E: EventRecord> {
    store: EventStore<E>,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
}

impl<E: EventRecord> EventConsumer<E> {
    /// Creates a consumer that will deliver every identifier `>= begin`.
    pub fn new(begin: EventId) -> Result<Self> {
        Self::with_config(begin, ConsumerConfig::default())
    }

    /// Creates a consumer with explicit eviction bounds.
    pub fn with_config(begin: EventId, config: ConsumerConfig) -> Result<Self> {
        Ok(Self {
            store: EventStore::new()?,
            config,
            state: Mutex::new(ConsumerState {
                ranges: vec![TrackedRange {
                    range: EventRange::open(begin),
                    since: Instant::now(),
                }],
            }),
        })
    }

    /// The checkpoint safe to persist as a resume point: every identifier
    /// below it is confirmed delivered (or permanently skipped by
    /// eviction).
    pub fn begin_event_id(&self) -> EventId {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .ranges
            .first()
            .map(|t| t.range.begin)
            .unwrap_or(EventId::NONE)
    }

    /// Loads every event covered by the tracked ranges and delivers each to
    /// `apply` exactly once, in increasing identifier order.
    ///
    /// Gapped identifiers are re-attempted on every call alongside new ones
    /// beyond the last known range. If `apply` fails, consuming stops
    /// immediately: ranges stay advanced only for the events already
    /// applied, the error propagates, and the caller's transaction rolls
    /// back, so no event is marked consumed without also being applied.
    ///
    /// An event outside every tracked range means the bookkeeping is
    /// corrupt; the consumer halts with [`Error::InvalidEventId`] and the
    /// owning manager must stop rather than serve an untrusted projection.
    pub fn consume(
        &self,
        tx: &mut Transaction<'_>,
        mut apply: impl FnMut(&E) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict(&mut state);

        let snapshot: Vec<EventRange> = state.ranges.iter().map(|t| t.range).collect();
        let reader = self.store.load_ranges(tx, &snapshot)?;

        let mut delivered = 0usize;
        for event in reader {
            let id = event.event_id();
            let idx = locate(&state.ranges, id).ok_or(Error::InvalidEventId { id })?;
            apply(&event)?;
            advance(&mut state.ranges, idx, id);
            delivered += 1;
        }
        if delivered > 0 {
            debug!(
                table = self.store.table(),
                delivered,
                begin = state.ranges.first().map(|t| t.range.begin.as_raw()).unwrap_or(0),
                "consumed events"
            );
        }
        Ok(())
    }

    fn evict(&self, state: &mut ConsumerState) {
        let table = self.store.table();
        let timeout = self.config.gap_timeout;
        state.ranges.retain(|t| {
            if t.range.is_open() || t.since.elapsed() <= timeout {
                return true;
            }
            warn!(table, gap = %t.range, "dropping stale gap; identifiers in it are skipped");
            false
        });
        while state.ranges.len() > self.config.window {
            if state.ranges[0].range.is_open() {
                break;
            }
            let dropped = state.ranges.remove(0);
            warn!(table, gap = %dropped.range, "dropping gap beyond window; identifiers in it are skipped");
        }
    }
}

// =============================================================================
// Range Arithmetic
// =============================================================================
// Kept free of locking and I/O so the split/advance boundaries can be tested
// exhaustively on their own.

/// Finds the index of the range containing `id`, if any.
fn locate(ranges: &[TrackedRange], id: EventId) -> Option<usize> {
    // Ranges are sorted by begin; the candidate is the last range whose
    // begin is <= id.
    let candidate = ranges.partition_point(|t| t.range.begin <= id);
    if candidate == 0 {
        return None;
    }
    let idx = candidate - 1;
    ranges[idx].range.contains(id).then_some(idx)
}

/// Removes `id` from the range at `idx`, advancing or splitting it.
fn advance(ranges: &mut Vec<TrackedRange>, idx: usize, id: EventId) {
    let tracked = ranges[idx];
    let range = tracked.range;

    if id == range.begin {
        let begin = id.next();
        let replacement = EventRange { begin, end: range.end };
        if replacement.is_empty() {
            // Fully closed gap.
            ranges.remove(idx);
        } else {
            ranges[idx].range = replacement;
        }
        return;
    }

    // Interior identifier: a gap remains below, and the remainder above.
    // Splitting the open tail creates a brand-new gap, so its age starts
    // now; halves of an existing gap keep the original age.
    let since = if range.is_open() { Instant::now() } else { tracked.since };
    ranges[idx] = TrackedRange {
        range: EventRange::new(range.begin, id),
        since,
    };
    let upper = EventRange {
        begin: id.next(),
        end: range.end,
    };
    if !upper.is_empty() {
        ranges.insert(idx + 1, TrackedRange { range: upper, since });
    }
}

// =============================================================================
// Tests
// =============================================================================
