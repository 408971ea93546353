// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_identifier!(
    /// One measured marker (e.g. "CD15"). Global across samples.
    ChannelId
);

string_identifier!(
    /// One specimen (e.g. "WCM1").
    SampleId
);

string_identifier!(
    /// The identity of a computed statistic, the first half of a cache key.
    FeatureId
);

/// The width of a [`Bitmask`] in bits, and therefore the maximum number of
/// channels a channel table may hold.
pub const BITMASK_WIDTH: usize = u64::BITS as usize;

/// The packed positive/negative calls of one cell, one bit per channel.
///
/// Bit positions are only meaningful relative to the `ChannelTable` that
/// produced them. The `#[repr(transparent)]` attribute guarantees this is a
/// zero-cost abstraction over the raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Bitmask(pub u64);

impl Bitmask {
    #[inline(always)]
    pub fn is_set(self, bit: u8) -> bool {
        self.0 & (1u64 << bit) != 0
    }

    #[inline(always)]
    pub fn with_bit(self, bit: u8) -> Self {
        Self(self.0 | (1u64 << bit))
    }
}

/// A per-sample, per-channel cutoff as it crosses the boundary of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecord {
    pub sample: SampleId,
    pub channel: ChannelId,
    pub value: f64,
}

/// A computed count for one (feature, sample) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureValue {
    pub feature: FeatureId,
    pub sample: SampleId,
    pub count: u64,
}
