//! Tier model: parsing, validation and tier addressing.
//!
//! A tier model is an ordered chain of retention tiers. Tier 0 is the raw
//! (finest) tier; every following tier must have a strictly larger duration
//! that is an exact multiple of its predecessor's, so a coarse slot always
//! covers a whole number of finer slots.
//!
//! # Syntax
//!
//! ```text
//! raw=1s:3600, 15s:5760, 1m:10080, 1h:8760
//! [ {1000ms}, {5000ms}, {60000ms} ]
//! ```
//!
//! Each tier is `[name=]<duration>[:<count>]`. The duration is an integer with
//! an optional `ms`, `s`, `m`, `h` or `d` unit (bare integers are
//! milliseconds). The count is how many slots the tier retains and defaults to
//! 60. Surrounding brackets and per-entry braces are ignored.
//!
//! The model is parsed once at startup. Parse failures are fatal
//! configuration errors; addressing itself never fails.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TierModelError;

/// Retention count used when a tier omits `:<count>`.
pub const DEFAULT_RETENTION_COUNT: i64 = 60;

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

// =============================================================================
// Tier
// =============================================================================

/// One retention level of a [`TierModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub index: usize,
    pub name: String,
    pub duration_ms: i64,
    pub retention_count: i64,
}

impl Tier {
    /// Total time span this tier keeps, in milliseconds.
    #[must_use]
    pub fn retention_ms(&self) -> i64 {
        self.duration_ms.saturating_mul(self.retention_count)
    }

    /// Start of the slot containing `timestamp_ms`, or `None` when that slot
    /// starts before `i64::MIN`.
    #[must_use]
    pub fn address(&self, timestamp_ms: i64) -> Option<i64> {
        timestamp_ms
            .div_euclid(self.duration_ms)
            .checked_mul(self.duration_ms)
    }

    fn covers_age(&self, age_ms: i64) -> bool {
        age_ms <= self.retention_ms()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}:{}",
            self.name,
            format_duration(self.duration_ms),
            self.retention_count
        )
    }
}

// =============================================================================
// TierModel
// =============================================================================

/// A validated, ordered chain of tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierModel {
    tiers: Vec<Tier>,
}

impl TierModel {
    /// Parse and validate a textual tier model.
    pub fn parse(spec: &str) -> Result<Self, TierModelError> {
        let body = strip_wrapping(spec.trim(), '[', ']');
        if body.trim().is_empty() {
            return Err(TierModelError::InvalidTierModel(
                "tier model is empty".to_string(),
            ));
        }

        let mut tiers: Vec<Tier> = Vec::new();
        for (index, raw) in body.split(',').enumerate() {
            let entry = strip_wrapping(raw.trim(), '{', '}').trim();
            if entry.is_empty() {
                return Err(TierModelError::InvalidTierModel(format!(
                    "tier {index} is empty"
                )));
            }
            let tier = parse_tier(index, entry)?;
            if tiers.iter().any(|t| t.name == tier.name) {
                return Err(TierModelError::InvalidTierModel(format!(
                    "duplicate tier name '{}'",
                    tier.name
                )));
            }
            tiers.push(tier);
        }

        Self::from_tiers(tiers)
    }

    /// Validate an already-built tier chain.
    pub fn from_tiers(tiers: Vec<Tier>) -> Result<Self, TierModelError> {
        if tiers.is_empty() {
            return Err(TierModelError::InvalidTierModel(
                "tier model is empty".to_string(),
            ));
        }
        for (i, tier) in tiers.iter().enumerate() {
            if tier.index != i {
                return Err(TierModelError::InvalidTierModel(format!(
                    "tier '{}' has index {} but is at position {i}",
                    tier.name, tier.index
                )));
            }
            if tier.duration_ms <= 0 || tier.retention_count <= 0 {
                return Err(TierModelError::InvalidTierModel(format!(
                    "tier '{}' must have a positive duration and count",
                    tier.name
                )));
            }
        }
        for (index, pair) in tiers.windows(2).enumerate() {
            let (previous_ms, next_ms) = (pair[0].duration_ms, pair[1].duration_ms);
            if next_ms <= previous_ms || next_ms % previous_ms != 0 {
                return Err(TierModelError::InvalidTierTripletPair {
                    index: index + 1,
                    previous_ms,
                    next_ms,
                });
            }
        }
        Ok(Self { tiers })
    }

    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always false for a validated model.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Tier> {
        self.tiers.get(index)
    }

    /// Aligned slot start of `timestamp_ms` in tier `tier_index`:
    /// `floor(timestamp / duration) * duration`.
    ///
    /// Returns `None` for an out-of-range tier index or a slot that is not
    /// representable.
    #[must_use]
    pub fn tier_address(&self, timestamp_ms: i64, tier_index: usize) -> Option<i64> {
        self.tiers
            .get(tier_index)
            .and_then(|t| t.address(timestamp_ms))
    }

    /// Retention window of the coarsest tier.
    #[must_use]
    pub fn max_retention_ms(&self) -> i64 {
        self.tiers.last().map_or(0, Tier::retention_ms)
    }

    /// Coarsest tier whose retention window still covers a sample of the
    /// given age, or `None` if the sample is too old for every tier.
    #[must_use]
    pub fn tier_for_retention(&self, age_ms: i64) -> Option<usize> {
        let age = age_ms.max(0);
        self.tiers
            .iter()
            .rev()
            .find(|t| t.covers_age(age))
            .map(|t| t.index)
    }

    /// Finest tier whose retention window covers the age. This is where a
    /// sample is filed at the best resolution still retained.
    #[must_use]
    pub fn finest_tier_for_age(&self, age_ms: i64) -> Option<usize> {
        let age = age_ms.max(0);
        self.tiers.iter().find(|t| t.covers_age(age)).map(|t| t.index)
    }
}

impl fmt::Display for TierModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tier) in self.tiers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tier}")?;
        }
        Ok(())
    }
}

impl FromStr for TierModel {
    type Err = TierModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TierModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TierModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn strip_wrapping(s: &str, open: char, close: char) -> &str {
    s.strip_prefix(open)
        .and_then(|rest| rest.strip_suffix(close))
        .unwrap_or(s)
}

fn parse_tier(index: usize, entry: &str) -> Result<Tier, TierModelError> {
    let (name, rest) = match entry.split_once('=') {
        Some((name, rest)) => {
            let name = name.trim();
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(TierModelError::InvalidTierModel(format!(
                    "tier {index} has an invalid name '{name}'"
                )));
            }
            (name.to_string(), rest.trim())
        }
        None => (format!("t{index}"), entry),
    };

    let (duration_text, count_text) = match rest.split_once(':') {
        Some((d, c)) => (d.trim(), Some(c.trim())),
        None => (rest, None),
    };

    let duration_ms = parse_duration(duration_text).ok_or_else(|| {
        TierModelError::InvalidTierModel(format!(
            "tier '{name}' has an invalid duration '{duration_text}'"
        ))
    })?;
    let retention_count = match count_text {
        Some(c) => c.parse::<i64>().map_err(|_| {
            TierModelError::InvalidTierModel(format!("tier '{name}' has an invalid count '{c}'"))
        })?,
        None => DEFAULT_RETENTION_COUNT,
    };

    Ok(Tier {
        index,
        name,
        duration_ms,
        retention_count,
    })
}

/// `<int>[ms|s|m|h|d]` to milliseconds. `None` on syntax error or overflow.
fn parse_duration(text: &str) -> Option<i64> {
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    if digits.is_empty() {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => 1,
        "s" => MS_PER_SECOND,
        "m" => MS_PER_MINUTE,
        "h" => MS_PER_HOUR,
        "d" => MS_PER_DAY,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Render milliseconds in the largest unit that divides evenly.
fn format_duration(ms: i64) -> String {
    for (unit, size) in [
        ("d", MS_PER_DAY),
        ("h", MS_PER_HOUR),
        ("m", MS_PER_MINUTE),
        ("s", MS_PER_SECOND),
    ] {
        if ms % size == 0 {
            return format!("{}{unit}", ms / size);
        }
    }
    format!("{ms}ms")
}
