//! Ordered server version type.
//!
//! `show server_version` yields strings like `15.4`, `9.6.24` or
//! `16beta1`. Comparing those lexically puts `10` before `9.6`, so the
//! pool parses them into numeric components and compares those instead.
//! Missing components count as zero: `9.6` equals `9.6.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unparseable server version: '{0}'")]
pub struct VersionParseError(pub String);

/// A dotted numeric server version.
#[derive(Debug, Clone)]
pub struct ServerVersion {
    parts: Vec<u32>,
    raw: String,
}

impl ServerVersion {
    /// Numeric components, major first.
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    /// The original version string as reported by the server.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ServerVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // First whitespace-separated token carries the version; vendor
        // builds append junk after it.
        let token = s
            .split_whitespace()
            .next()
            .ok_or_else(|| VersionParseError(s.to_string()))?;

        let mut parts = Vec::new();
        for component in token.split('.') {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            match digits.parse::<u32>() {
                Ok(n) => parts.push(n),
                Err(_) => break,
            }
            // A suffix like `beta1` ends the numeric prefix.
            if digits.len() != component.len() {
                break;
            }
        }

        if parts.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }

        Ok(Self {
            parts,
            raw: s.to_string(),
        })
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for ServerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ServerVersion {}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}
