//! CPU utilization accounting.
//!
//! Two views of core activity exist side by side: every core keeps a
//! short sliding [`UtilizationWindow`] of busy/idle samples for its
//! recent-utilization percentage, and the system keeps one
//! [`CpuTimeline`] that ORs all cores' samples together for the
//! whole-run active/idle tick totals shown by vmstat.

use std::sync::Mutex;

/// Number of samples in a core's sliding utilization window.
pub const UTILIZATION_WINDOW: usize = 10;

/// Fixed-size sliding window of busy (`true`) / idle (`false`) samples.
#[derive(Debug, Clone)]
pub struct UtilizationWindow {
    samples: std::collections::VecDeque<bool>,
}

impl UtilizationWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(UTILIZATION_WINDOW),
        }
    }

    /// Push one sample, evicting the oldest when the window is full.
    pub fn record(&mut self, busy: bool) {
        while self.samples.len() >= UTILIZATION_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(busy);
    }

    /// Busy share of the window as a percentage. An empty window is 0%.
    pub fn percent(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let busy = self.samples.iter().filter(|&&b| b).count();
        busy as f64 / self.samples.len() as f64 * 100.0
    }
}

impl Default for UtilizationWindow {
    fn default() -> Self {
        Self::new()
    }
}

struct TimelineInner {
    /// One sample track per core.
    tracks: Vec<Vec<bool>>,
    /// OR of all tracks, position by position.
    merged: Vec<bool>,
    /// Number of `true` entries in `merged`.
    active: usize,
}

/// System-wide CPU activity: the OR of every core's sample track.
///
/// A tick position counts as *active* if any core was busy at its own
/// position `i`; the pair returned by [`CpuTimeline::query`] is
/// `(active, total)` tick counts for the whole run.
pub struct CpuTimeline {
    inner: Mutex<TimelineInner>,
}

impl CpuTimeline {
    /// Create a timeline with no tracks.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimelineInner {
                tracks: Vec::new(),
                merged: Vec::new(),
                active: 0,
            }),
        }
    }

    /// Register a new core track and return its index.
    pub fn add_track(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.tracks.push(Vec::new());
        inner.tracks.len() - 1
    }

    /// Append one sample to a track, merging it into the system row.
    pub fn record(&self, track: usize, busy: bool) {
        let mut inner = self.inner.lock().unwrap();
        if track >= inner.tracks.len() {
            return;
        }

        inner.tracks[track].push(busy);
        let position = inner.tracks[track].len() - 1;

        if position >= inner.merged.len() {
            inner.merged.resize(position + 1, false);
        }
        if busy && !inner.merged[position] {
            inner.merged[position] = true;
            inner.active += 1;
        }
    }

    /// `(active, total)` tick counts across all cores.
    pub fn query(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.active, inner.merged.len())
    }
}

impl Default for CpuTimeline {
    fn default() -> Self {
        Self::new()
    }
}
