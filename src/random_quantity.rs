//! Fixed-capacity ring buffer of floating-point observations with mean and
//! variance computed over the live window (spec §3, §4.3).

/// Default capacity used wherever a caller doesn't need a tighter window.
pub const DEFAULT_CAPACITY: usize = 30;

#[derive(Debug, Clone)]
pub struct RandomQuantity {
    buf: Vec<f64>,
    capacity: usize,
    /// Index the next `observe` will overwrite.
    next: usize,
    /// Total observations ever written, saturating — used only to tell
    /// whether the buffer has wrapped (`written >= capacity`).
    written: u64,
}

impl RandomQuantity {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RandomQuantity capacity must be positive");
        RandomQuantity {
            buf: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            written: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Overwrites the oldest observation (or appends, while still filling).
    pub fn observe(&mut self, x: f64) {
        if self.buf.len() < self.capacity {
            self.buf.push(x);
        } else {
            self.buf[self.next] = x;
        }
        self.next = (self.next + 1) % self.capacity;
        self.written = self.written.saturating_add(1);
    }

    /// Number of values currently held: `min(written, capacity)`.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The most recently written observation, if any.
    pub fn last(&self) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        let idx = if self.next == 0 {
            self.buf.len() - 1
        } else {
            self.next - 1
        };
        Some(self.buf[idx])
    }

    /// Precondition: `size() > 0`. Panics otherwise — callers must check
    /// `is_empty()` first (spec §8 boundary behavior).
    pub fn mean(&self) -> f64 {
        assert!(!self.buf.is_empty(), "mean() called on an empty RandomQuantity");
        self.buf.iter().sum::<f64>() / self.buf.len() as f64
    }

    /// Sample variance (Bessel-corrected) given a precomputed mean.
    /// Precondition: `size() > 1`.
    pub fn variance(&self, mean: f64) -> f64 {
        assert!(
            self.buf.len() > 1,
            "variance() needs at least 2 observations"
        );
        let n = self.buf.len() as f64;
        self.buf.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.next = 0;
        self.written = 0;
    }

    pub fn values(&self) -> &[f64] {
        &self.buf
    }
}

impl Default for RandomQuantity {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
