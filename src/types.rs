//! Core types for tandem-dl
//!
//! Identifiers and small enums shared across the engine, the download
//! groups and the protocol tasks.

use std::fmt;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

/// Call id of a scheduled task. Unique per engine, never reused.
pub type Cuid = u64;

/// Unique identifier for a download group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(u64);

impl GroupId {
    /// Create a new random non-zero group id
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let n: u64 = rng.random();
            if n != 0 {
                return Self(n);
            }
        }
    }

    /// Wrap a raw id. Zero is reserved and rejected.
    pub fn from_raw(n: u64) -> Option<Self> {
        (n != 0).then_some(Self(n))
    }

    /// Get the raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }

    /// 16-character lowercase hex form used in logs and results
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse the 16-character hex form
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().and_then(Self::from_raw)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Why a halt was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    #[default]
    None,
    ShutdownSignal,
    UserRequest,
}

/// Lifecycle state of a download group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Registered, no task created yet
    #[default]
    Waiting,
    /// At least one task has been created
    Active,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_hex() {
        let gid = GroupId::from_raw(0x2089b05ecca3d829).unwrap();
        assert_eq!(gid.to_hex(), "2089b05ecca3d829");
        assert_eq!(GroupId::from_hex("2089b05ecca3d829"), Some(gid));
        assert_eq!(GroupId::from_hex("0000000000000000"), None);
        assert_eq!(GroupId::from_hex("abc"), None);
    }

    #[test]
    fn test_random_group_id_nonzero() {
        for _ in 0..100 {
            assert_ne!(GroupId::random().get(), 0);
        }
    }
}
