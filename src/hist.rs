//! Log2-bucketed size histograms
//!
//! Each heap keeps histograms of allocation, free, and inject sizes.
//! When an allocation fails the histograms are written to the log just
//! before `NoSpace` is surfaced, so the operator can see what filled the
//! pool.

#[derive(Clone)]
pub struct HistogramLog2 {
    buckets: [u64; 64],
    count: u64,
}

impl HistogramLog2 {
    pub fn new() -> Self {
        Self {
            buckets: [0; 64],
            count: 0,
        }
    }

    #[inline]
    pub fn enter(&mut self, size: usize) {
        let ix = (64 - (size | 1).leading_zeros() as usize).saturating_sub(1);
        self.buckets[ix] += 1;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Occupied buckets as `(log2_floor, count)` pairs
    pub fn entries(&self) -> Vec<(u32, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, &c)| c != 0)
            .map(|(i, &c)| (i as u32, c))
            .collect()
    }

    pub fn write_to_log(&self, what: &str) {
        if self.count == 0 {
            return;
        }
        let mut line = format!("{} histogram ({} samples):", what, self.count);
        for (lg, c) in self.entries() {
            line.push_str(&format!(" [2^{}]={}", lg, c));
        }
        eprintln!("{}", line);
    }
}

impl Default for HistogramLog2 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes_land_in_log2_buckets() {
        let mut h = HistogramLog2::new();
        h.enter(1);
        h.enter(2);
        h.enter(3);
        h.enter(4);
        h.enter(1024);
        assert_eq!(h.count(), 5);
        let e = h.entries();
        assert_eq!(e, vec![(0, 1), (1, 2), (2, 1), (10, 1)]);
    }

    #[test]
    fn zero_size_does_not_panic() {
        let mut h = HistogramLog2::new();
        h.enter(0);
        assert_eq!(h.entries(), vec![(0, 1)]);
    }
}
