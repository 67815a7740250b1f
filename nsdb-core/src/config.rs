//! Engine configuration

use crate::{NsdbError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsdbConfig {
    /// Root directory for schemas and indices
    pub base_path: PathBuf,
    /// Duration of each shard window (`shard.interval`)
    pub shard_interval: Duration,
    /// Flush period of the write accumulator (`write.scheduler.interval`)
    pub write_scheduler_interval: Duration,
    /// Safety cap applied to unbounded reads (`query.default_limit`)
    pub default_limit: usize,
    /// Replicas per shard; consumed by the cluster layer, opaque here
    pub replication_factor: u32,
    /// Idle duration after which index handles may be closed
    pub passivate_after: Duration,
    /// Deadline for read requests
    pub read_timeout: Duration,
}

impl Default for NsdbConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
            shard_interval: Duration::from_secs(30),
            write_scheduler_interval: Duration::from_secs(5),
            default_limit: 1000,
            replication_factor: 1,
            passivate_after: Duration::from_secs(300),
            read_timeout: Duration::from_secs(10),
        }
    }
}

impl NsdbConfig {
    /// Shard window width in milliseconds
    pub fn shard_interval_ms(&self) -> i64 {
        self.shard_interval.as_millis() as i64
    }
}

/// Parse a duration string like `250ms`, `5s`, `10min`, `2h`, `10d`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| NsdbError::Config(format!("missing unit in duration: {}", s)))?;
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| NsdbError::Config(format!("invalid duration number: {}", s)))?;

    let millis = match unit.trim().to_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => num,
        "s" | "sec" | "second" | "seconds" => num * 1_000,
        "min" | "minute" | "minutes" => num * 60_000,
        "h" | "hour" | "hours" => num * 3_600_000,
        "d" | "day" | "days" => num * 86_400_000,
        other => {
            return Err(NsdbError::Config(format!(
                "unknown duration unit: {}",
                other
            )))
        }
    };

    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("10min").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("10d").unwrap(), Duration::from_secs(864_000));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5parsecs").is_err());
    }
}
