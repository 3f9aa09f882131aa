//! Weighted-random request routing.
//!
//! Picks one run from an active set snapshot per inference request. Runs are
//! walked in snapshot order with a running sum of their fractions; the first run
//! whose running sum exceeds the draw wins. If float drift leaves the draw at or
//! above the final sum, the last run is picked.

use metrics::counter;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Something with a share of traffic.
pub trait Weighted {
    fn fraction(&self) -> f64;

    /// Label used in logs and metrics.
    fn label(&self) -> &str;
}

/// Pure selection for a draw `r` in `[0, 1)`. Returns None only for an empty set.
pub fn select_with_draw<T: Weighted>(items: &[T], r: f64) -> Option<&T> {
    let mut cumulative = 0.0;
    for item in items {
        cumulative += item.fraction();
        if cumulative > r {
            return Some(item);
        }
    }

    let last = items.last()?;
    warn!(draw = r, total = cumulative, run = last.label(), "Fractions fell short of the draw, using last run");
    Some(last)
}

/// Per-process seed from start time, process id and host identity.
fn process_seed() -> u64 {
    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    std::env::var("HOSTNAME").unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

/// Router holding the process-local random source.
pub struct Router {
    rng: Mutex<StdRng>,
}

impl Router {
    /// Seeded independently per process.
    pub fn new() -> Self {
        let seed = process_seed();
        debug!(seed, "Router seeded");
        Self::with_seed(seed)
    }

    /// Deterministic router for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Draws uniformly from `[0, 1)`.
    pub fn draw(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }

    /// Picks a run from the snapshot.
    pub fn select<'a, T: Weighted>(&self, items: &'a [T]) -> Option<&'a T> {
        let r = self.draw();
        let selected = select_with_draw(items, r)?;
        counter!("canaria_router_selections_total", "run_id" => selected.label().to_string()).increment(1);
        Some(selected)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
