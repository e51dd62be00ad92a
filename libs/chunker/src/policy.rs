//! Chunk size policy.

use std::fmt;
use std::str::FromStr;

use fastcdc::v2020;
use serde::{Deserialize, Serialize};

use crate::error::ChunkerError;

/// Minimum, average and maximum chunk size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSizePolicy {
    pub min: u32,
    pub avg: u32,
    pub max: u32,
}

impl ChunkSizePolicy {
    /// Build a policy from sizes in KiB.
    pub fn from_kib(min: u32, avg: u32, max: u32) -> Result<Self, ChunkerError> {
        let input = format!("{min}:{avg}:{max}");
        let bytes = |kib: u32| {
            kib.checked_mul(1024)
                .ok_or_else(|| ChunkerError::policy(&input, "size overflows"))
        };
        let policy = Self {
            min: bytes(min)?,
            avg: bytes(avg)?,
            max: bytes(max)?,
        };
        policy.validate(&input)?;
        Ok(policy)
    }

    pub(crate) fn validate(&self, input: &str) -> Result<(), ChunkerError> {
        if !(self.min <= self.avg && self.avg <= self.max) {
            return Err(ChunkerError::policy(input, "expected min <= avg <= max"));
        }
        if !(v2020::MINIMUM_MIN..=v2020::MINIMUM_MAX).contains(&self.min) {
            return Err(ChunkerError::policy(input, "min out of range"));
        }
        if !(v2020::AVERAGE_MIN..=v2020::AVERAGE_MAX).contains(&self.avg) {
            return Err(ChunkerError::policy(input, "avg out of range"));
        }
        if !(v2020::MAXIMUM_MIN..=v2020::MAXIMUM_MAX).contains(&self.max) {
            return Err(ChunkerError::policy(input, "max out of range"));
        }
        Ok(())
    }
}

impl Default for ChunkSizePolicy {
    /// 16:64:256 KiB.
    fn default() -> Self {
        Self {
            min: 16 * 1024,
            avg: 64 * 1024,
            max: 256 * 1024,
        }
    }
}

impl FromStr for ChunkSizePolicy {
    type Err = ChunkerError;

    /// Parse `"min:avg:max"` in KiB.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [min, avg, max] = parts.as_slice() else {
            return Err(ChunkerError::policy(s, "expected min:avg:max"));
        };
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|e| ChunkerError::policy(s, e.to_string()))
        };
        let (min, avg, max) = (parse(min)?, parse(avg)?, parse(max)?);
        Self::from_kib(min, avg, max)
    }
}

impl fmt::Display for ChunkSizePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.min / 1024,
            self.avg / 1024,
            self.max / 1024
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_policy() {
        let policy: ChunkSizePolicy = "16:64:256".parse().unwrap();
        assert_eq!(policy, ChunkSizePolicy::default());
        assert_eq!(policy.to_string(), "16:64:256");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for input in ["", "16:64", "16:64:256:1", "a:b:c", "64:16:256", "16:64:999999"] {
            assert!(
                input.parse::<ChunkSizePolicy>().is_err(),
                "{input} should not parse"
            );
        }
    }
}
