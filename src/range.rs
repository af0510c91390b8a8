use fleetbench_macros::message;

/// Half-open interval `[start, end)` of key indices or operation counts.
#[message]
#[derive(Copy, Eq, Hash, Default)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start {start} past end {end}");
        Self { start, end }
    }

    /// Splits `[0, total)` into `parts` contiguous intervals and returns the
    /// one at `index`.
    ///
    /// Every interval has `total / parts` elements; the first
    /// `total % parts` intervals get one more. Indices past `parts` yield an
    /// empty interval at the end of the space.
    pub fn divide_range(total: u64, parts: u64, index: u64) -> Self {
        if parts == 0 {
            return Self::new(total, total);
        }
        let base = total / parts;
        let remainder = total % parts;
        let start = index
            .saturating_mul(base)
            .saturating_add(index.min(remainder))
            .min(total);
        let size = if index < parts {
            base + u64::from(index < remainder)
        } else {
            0
        };
        Self::new(start, (start + size).min(total))
    }

    /// The same interval moved up by `offset`, `None` if it would pass
    /// `u64::MAX`.
    pub fn shift(self, offset: u64) -> Option<Self> {
        Some(Self::new(
            self.start.checked_add(offset)?,
            self.end.checked_add(offset)?,
        ))
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, value: u64) -> bool {
        (self.start..self.end).contains(&value)
    }

    pub fn iter(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
