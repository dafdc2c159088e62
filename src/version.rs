use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::error::ServiceError;

/// Server version, read once from the `VERSION` file at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingCompat {
    Compatible,
    /// Client patch is ahead of the server's; accepted with a notice.
    ClientAhead,
}

impl Version {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading version file: {}", path.display()))?;
        raw.trim().parse()
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(anyhow!("version must be major.minor.patch: {s}"));
        };
        Ok(Self {
            major: major.parse().with_context(|| format!("bad version: {s}"))?,
            minor: minor.parse().with_context(|| format!("bad version: {s}"))?,
            patch: patch.parse().with_context(|| format!("bad version: {s}"))?,
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Major and minor must match the server's; patch may lag. A client patch
/// ahead of the server's still passes, flagged as a non-master build.
pub fn check_compat(server: Version, client: Version) -> Result<PingCompat, ServiceError> {
    if client.major != server.major || client.minor != server.minor {
        return Err(ServiceError::VersionIncompatible);
    }
    if client.patch > server.patch {
        Ok(PingCompat::ClientAhead)
    } else {
        Ok(PingCompat::Compatible)
    }
}
