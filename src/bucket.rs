//! Timeout buckets.
//!
//! Breaker state is segmented by timeout so that calls with very different
//! deadlines in the same group open and close independently.

use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU64;
use std::time::Duration;

use crate::error::ConfigError;

/// Closed range of timeout values, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketRange {
    lower: u64,
    upper: u64,
}

impl BucketRange {
    /// Sentinel range covering every timeout; used when bucketing is disabled.
    pub const ALL: BucketRange = BucketRange {
        lower: 0,
        upper: u64::MAX,
    };

    /// Creates the range `[lower, upper]`.
    pub const fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// Inclusive lower bound.
    pub fn lower(&self) -> u64 {
        self.lower
    }

    /// Inclusive upper bound.
    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Returns true for the all-inclusive sentinel.
    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    /// Returns true if `millis` falls inside the range.
    pub fn contains(&self, millis: u64) -> bool {
        self.lower <= millis && millis <= self.upper
    }
}

impl Display for BucketRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

/// Maps a call's timeout to the bucket holding its breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketRangeFinder {
    /// Every timeout shares [`BucketRange::ALL`].
    Single,

    /// Fixed-width buckets: `[n*w, n*w + w - 1]`.
    Fixed {
        /// Bucket width in milliseconds.
        width: NonZeroU64,
    },
}

impl BucketRangeFinder {
    /// Creates a finder with buckets `width_millis` wide.
    pub fn fixed(width_millis: u64) -> Result<Self, ConfigError> {
        NonZeroU64::new(width_millis)
            .map(|width| BucketRangeFinder::Fixed { width })
            .ok_or(ConfigError::NotPositive {
                option: "bucket width",
            })
    }

    /// Picks a finder for an optional bucket width.
    pub fn from_width(width_millis: Option<u64>) -> Result<Self, ConfigError> {
        match width_millis {
            Some(width) => Self::fixed(width),
            None => Ok(BucketRangeFinder::Single),
        }
    }

    /// Finds the bucket of `timeout`.
    pub fn find(&self, timeout: Duration) -> BucketRange {
        match self {
            BucketRangeFinder::Single => BucketRange::ALL,
            BucketRangeFinder::Fixed { width } => {
                let width = width.get();
                let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                let lower = (millis / width) * width;
                BucketRange::new(lower, lower.saturating_add(width - 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn fixed_buckets_share_a_range() {
        let finder = BucketRangeFinder::fixed(10).unwrap();

        assert_eq!(finder.find(ms(17)), finder.find(ms(18)));
        assert_eq!(finder.find(ms(17)), finder.find(ms(10)));
        assert_eq!(finder.find(ms(17)), BucketRange::new(10, 19));
        assert_ne!(finder.find(ms(17)), finder.find(ms(20)));
        assert_eq!(finder.find(ms(20)), BucketRange::new(20, 29));
    }

    #[test]
    fn first_bucket_starts_at_zero() {
        let finder = BucketRangeFinder::fixed(50).unwrap();
        assert_eq!(finder.find(ms(35)), BucketRange::new(0, 49));
        assert_eq!(finder.find(ms(55)), BucketRange::new(50, 99));
    }

    #[test]
    fn zero_width_is_rejected() {
        assert_eq!(
            BucketRangeFinder::fixed(0),
            Err(ConfigError::NotPositive {
                option: "bucket width"
            })
        );
    }

    #[test]
    fn missing_width_means_single_bucket() {
        assert_eq!(
            BucketRangeFinder::from_width(None),
            Ok(BucketRangeFinder::Single)
        );
    }

    #[test]
    fn sentinel_formats_and_compares_by_value() {
        assert!(BucketRange::new(0, u64::MAX).is_all());
        assert_eq!(BucketRange::new(10, 19).to_string(), "10-19");
    }

    proptest! {
        #[test]
        fn single_bucket_maps_everything_together(a in 0u64..1_000_000, b in 0u64..1_000_000) {
            let finder = BucketRangeFinder::Single;
            prop_assert_eq!(finder.find(ms(a)), finder.find(ms(b)));
        }

        #[test]
        fn fixed_bucket_contains_its_timeout(t in 0u64..1_000_000, w in 1u64..10_000) {
            let range = BucketRangeFinder::fixed(w).unwrap().find(ms(t));
            prop_assert!(range.contains(t));
            prop_assert_eq!(range.upper() - range.lower() + 1, w);
            prop_assert_eq!(range.lower() % w, 0);
        }
    }
}
