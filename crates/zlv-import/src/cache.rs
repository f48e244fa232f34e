use dashmap::DashMap;
use uuid::Uuid;

/// Run-scoped memo of owner pairs already scored. Keys are unordered pairs,
/// so `(a, b)` and `(b, a)` share one entry; entries are never removed.
#[derive(Debug, Default)]
pub struct ComparisonCache {
    scores: DashMap<(Uuid, Uuid), f64>,
}

impl ComparisonCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn has(&self, a: Uuid, b: Uuid) -> bool {
        self.scores.contains_key(&Self::key(a, b))
    }

    pub fn get(&self, a: Uuid, b: Uuid) -> Option<f64> {
        self.scores.get(&Self::key(a, b)).map(|entry| *entry)
    }

    /// Records a score. The first score stored for a pair is kept.
    pub fn add(&self, a: Uuid, b: Uuid, score: f64) {
        self.scores.entry(Self::key(a, b)).or_insert(score);
    }

    /// Cached score, computing and storing it on a miss.
    pub fn get_or_insert_with(&self, a: Uuid, b: Uuid, score: impl FnOnce() -> f64) -> f64 {
        *self.scores.entry(Self::key(a, b)).or_insert_with(score)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}
