//! Deterministic date-based shard routing for telemetry storage.
//!
//! A reading's shard is a pure function of its timestamp, so routing never
//! requires a lookup: two readings with the same timestamp (to shard
//! granularity) always land in the same shard regardless of write order or
//! batch composition.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How far a shard spans on the time axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardGranularity {
    /// One table per calendar day
    Day,
    /// One table per calendar month
    Month,
    /// One table per calendar year
    Year,
}

/// Sharding policy: granularity plus the table naming scheme.
///
/// Only meaningful when the storage kind is `Sharded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingPolicy {
    /// Expansion granularity
    pub granularity: ShardGranularity,
    /// Prefix for shard table names, e.g. `telemetry_data`
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

fn default_table_prefix() -> String {
    "telemetry_data".to_string()
}

impl ShardingPolicy {
    /// Policy with the default table prefix
    pub fn new(granularity: ShardGranularity) -> Self {
        Self {
            granularity,
            table_prefix: default_table_prefix(),
        }
    }

    /// Shard that owns a reading with timestamp `ts`
    pub fn shard_for(&self, ts: DateTime<Utc>) -> ShardId {
        let date = ts.date_naive();
        let start = match self.granularity {
            ShardGranularity::Day => date,
            ShardGranularity::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .unwrap_or(date),
            ShardGranularity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        };
        ShardId {
            start,
            granularity: self.granularity,
        }
    }

    /// Covering set of shards for the half-open query window `[from, to)`,
    /// ascending by time. Empty when the window is empty.
    pub fn covering(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<ShardId> {
        let mut shards = Vec::new();
        if from >= to {
            return shards;
        }
        let mut shard = self.shard_for(from);
        while shard.start_ts() < to {
            let next = shard.next();
            shards.push(shard);
            shard = next;
        }
        shards
    }

    /// Table name for a shard under this policy
    pub fn table_name(&self, shard: &ShardId) -> String {
        format!("{}_{}", self.table_prefix, shard.suffix())
    }
}

/// One shard: the start of its time span at the policy's granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId {
    start: NaiveDate,
    granularity: ShardGranularity,
}

impl ShardId {
    /// First instant covered by the shard
    pub fn start_ts(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start.and_hms_opt(0, 0, 0).expect("midnight is valid"))
    }

    /// First instant of the following shard
    pub fn end_ts(&self) -> DateTime<Utc> {
        self.next().start_ts()
    }

    /// The shard immediately after this one
    pub fn next(&self) -> ShardId {
        let start = match self.granularity {
            ShardGranularity::Day => self
                .start
                .succ_opt()
                .expect("date range exhausted"),
            ShardGranularity::Month => {
                let (y, m) = if self.start.month() == 12 {
                    (self.start.year() + 1, 1)
                } else {
                    (self.start.year(), self.start.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1).expect("first of month is valid")
            }
            ShardGranularity::Year => NaiveDate::from_ymd_opt(self.start.year() + 1, 1, 1)
                .expect("first of year is valid"),
        };
        ShardId {
            start,
            granularity: self.granularity,
        }
    }

    /// Table-name suffix: `20240101`, `202401` or `2024` depending on
    /// granularity
    pub fn suffix(&self) -> String {
        match self.granularity {
            ShardGranularity::Day => self.start.format("%Y%m%d").to_string(),
            ShardGranularity::Month => self.start.format("%Y%m").to_string(),
            ShardGranularity::Year => self.start.format("%Y").to_string(),
        }
    }

    /// Parse a table-name suffix back into a shard id. Returns `None` for
    /// names that do not belong to the given granularity's naming scheme.
    pub fn from_suffix(suffix: &str, granularity: ShardGranularity) -> Option<ShardId> {
        let expected_len = match granularity {
            ShardGranularity::Day => 8,
            ShardGranularity::Month => 6,
            ShardGranularity::Year => 4,
        };
        if suffix.len() != expected_len || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let padded = match granularity {
            ShardGranularity::Day => suffix.to_string(),
            ShardGranularity::Month => format!("{suffix}01"),
            ShardGranularity::Year => format!("{suffix}0101"),
        };
        let start = NaiveDate::parse_from_str(&padded, "%Y%m%d").ok()?;
        Some(ShardId { start, granularity })
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn equal_timestamps_route_to_the_same_shard() {
        let policy = ShardingPolicy::new(ShardGranularity::Day);
        let a = policy.shard_for(ts(2024, 1, 1, 10));
        let b = policy.shard_for(ts(2024, 1, 1, 23));
        assert_eq!(a, b);
        assert_eq!(a.suffix(), "20240101");
    }

    #[test]
    fn daily_covering_set_for_two_day_window() {
        let policy = ShardingPolicy::new(ShardGranularity::Day);
        let shards = policy.covering(ts(2024, 1, 1, 0), ts(2024, 1, 3, 0));
        let suffixes: Vec<_> = shards.iter().map(ShardId::suffix).collect();
        assert_eq!(suffixes, vec!["20240101", "20240102"]);
    }

    #[test]
    fn covering_includes_partial_shards_at_both_ends() {
        let policy = ShardingPolicy::new(ShardGranularity::Day);
        let shards = policy.covering(ts(2024, 1, 1, 22), ts(2024, 1, 2, 1));
        let suffixes: Vec<_> = shards.iter().map(ShardId::suffix).collect();
        assert_eq!(suffixes, vec!["20240101", "20240102"]);
    }

    #[test]
    fn empty_window_covers_nothing() {
        let policy = ShardingPolicy::new(ShardGranularity::Day);
        assert!(policy.covering(ts(2024, 1, 2, 0), ts(2024, 1, 2, 0)).is_empty());
        assert!(policy.covering(ts(2024, 1, 3, 0), ts(2024, 1, 2, 0)).is_empty());
    }

    #[test]
    fn month_shards_roll_over_december() {
        let policy = ShardingPolicy::new(ShardGranularity::Month);
        let shards = policy.covering(ts(2023, 12, 15, 0), ts(2024, 2, 1, 0));
        let suffixes: Vec<_> = shards.iter().map(ShardId::suffix).collect();
        assert_eq!(suffixes, vec!["202312", "202401"]);
    }

    #[test]
    fn year_granularity_truncates_to_january_first() {
        let policy = ShardingPolicy::new(ShardGranularity::Year);
        let shard = policy.shard_for(ts(2024, 7, 9, 12));
        assert_eq!(shard.suffix(), "2024");
        assert_eq!(shard.start_ts(), ts(2024, 1, 1, 0));
        assert_eq!(shard.end_ts(), ts(2025, 1, 1, 0));
    }

    #[test]
    fn suffix_round_trips_through_parsing() {
        let policy = ShardingPolicy::new(ShardGranularity::Month);
        let shard = policy.shard_for(ts(2024, 11, 20, 3));
        let parsed = ShardId::from_suffix(&shard.suffix(), ShardGranularity::Month).unwrap();
        assert_eq!(parsed, shard);

        assert!(ShardId::from_suffix("2024", ShardGranularity::Day).is_none());
        assert!(ShardId::from_suffix("abcd", ShardGranularity::Year).is_none());
        assert!(ShardId::from_suffix("20241301", ShardGranularity::Day).is_none());
    }

    #[test]
    fn table_names_use_the_policy_prefix() {
        let policy = ShardingPolicy {
            granularity: ShardGranularity::Day,
            table_prefix: "readings".to_string(),
        };
        let shard = policy.shard_for(ts(2024, 3, 5, 0));
        assert_eq!(policy.table_name(&shard), "readings_20240305");
    }
}
