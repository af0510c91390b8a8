use fleetbench_macros::message;

/// Sub-buckets per power of two.
const SUB_BUCKETS: u64 = 4;
const SUB_BITS: u32 = 2;
/// Highest power of two with its own buckets; 2^41 ns (~36 min) and above
/// land in the last bucket.
const MAX_EXPONENT: u32 = 40;
/// Number of buckets in every histogram.
pub const BUCKET_COUNT: usize = (SUB_BUCKETS + (MAX_EXPONENT as u64 - 1) * SUB_BUCKETS) as usize;

/// Log-linear latency histogram over nanoseconds.
///
/// Values below 4 ns get one bucket each; every power of two above is split
/// into four equally wide buckets, so relative bucket width stays under 25%
/// from nanoseconds up to tens of minutes. The layout is fixed, which makes
/// merging an element-wise sum. Decoding rejects any other bucket count.
#[message]
#[derive(Eq)]
#[serde(try_from = "RawHistogram")]
pub struct LatencyHistogram {
    counts: Vec<u64>,
}

#[derive(serde::Deserialize)]
struct RawHistogram {
    counts: Vec<u64>,
}

impl TryFrom<RawHistogram> for LatencyHistogram {
    type Error = String;

    fn try_from(raw: RawHistogram) -> Result<Self, Self::Error> {
        if raw.counts.len() != BUCKET_COUNT {
            return Err(format!(
                "histogram has {} buckets, expected {BUCKET_COUNT}",
                raw.counts.len()
            ));
        }
        Ok(Self { counts: raw.counts })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; BUCKET_COUNT],
        }
    }

    pub fn record(&mut self, nanos: u64) {
        let index = bucket_index(nanos);
        self.counts[index] += 1;
    }

    pub fn merge(&mut self, other: &Self) {
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Estimates the value at quantile `q` in `[0, 1]`, interpolating linearly
    /// inside the bucket that holds the target rank.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let rank = q.clamp(0.0, 1.0) * total as f64;
        let mut seen = 0u64;
        for (index, &count) in self.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            if (seen + count) as f64 >= rank {
                let lower = bucket_lower_bound(index) as f64;
                let upper = bucket_lower_bound(index + 1) as f64;
                let fraction = ((rank - seen as f64) / count as f64).clamp(0.0, 1.0);
                return Some(lower + (upper - lower) * fraction);
            }
            seen += count;
        }
        // rank == total after rounding; answer with the top of the last bucket
        let last = self.counts.iter().rposition(|&c| c > 0)?;
        Some(bucket_lower_bound(last + 1) as f64)
    }

    /// Bucket boundaries and counts spanning the first to the last non-empty
    /// bucket. `ranges` has one more element than `counts`.
    pub fn ranges(&self) -> (Vec<u64>, Vec<u64>) {
        let Some(first) = self.counts.iter().position(|&c| c > 0) else {
            return (Vec::new(), Vec::new());
        };
        let last = self.counts.iter().rposition(|&c| c > 0).unwrap_or(first);
        let ranges = (first..=last + 1).map(bucket_lower_bound).collect();
        let counts = self.counts[first..=last].to_vec();
        (ranges, counts)
    }
}

pub(crate) fn bucket_index(nanos: u64) -> usize {
    if nanos < SUB_BUCKETS {
        return nanos as usize;
    }
    let exponent = 63 - nanos.leading_zeros();
    if exponent > MAX_EXPONENT {
        return BUCKET_COUNT - 1;
    }
    let sub = (nanos >> (exponent - SUB_BITS)) - SUB_BUCKETS;
    (SUB_BUCKETS + u64::from(exponent - SUB_BITS) * SUB_BUCKETS + sub) as usize
}

/// Inclusive lower bound of bucket `index`; `bucket_lower_bound(i + 1)` is the
/// exclusive upper bound of bucket `i`.
pub(crate) fn bucket_lower_bound(index: usize) -> u64 {
    let index = index as u64;
    if index < SUB_BUCKETS {
        return index;
    }
    let offset = index - SUB_BUCKETS;
    let exponent = offset / SUB_BUCKETS + u64::from(SUB_BITS);
    let sub = offset % SUB_BUCKETS;
    (SUB_BUCKETS + sub) << (exponent - u64::from(SUB_BITS))
}
