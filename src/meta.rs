/*
Filesystem metadata snapshots and the comparison policy the analyzer
applies on top of byte identity. Size always participates; the remaining
fields are toggled per run and recorded in the report's policy vector.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Which metadata fields count toward an "identical" verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPolicy {
    pub mtime: bool,
    pub atime: bool,
    pub ctime: bool,
    pub owner: bool,
    pub group: bool,
    pub mode: bool,
}

impl Default for MetadataPolicy {
    fn default() -> Self {
        Self {
            mtime: true,
            atime: false,
            ctime: false,
            owner: true,
            group: true,
            mode: true,
        }
    }
}

/// Point-in-time metadata of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub mtime_ns: i64,
    pub atime_ns: i64,
    pub ctime_ns: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

const NANOS: i64 = 1_000_000_000;

pub fn mtime_ns(md: &fs::Metadata) -> i64 {
    md.mtime() * NANOS + md.mtime_nsec()
}

impl FileMeta {
    pub fn from_metadata(md: &fs::Metadata) -> Self {
        Self {
            size: md.size(),
            mtime_ns: mtime_ns(md),
            atime_ns: md.atime() * NANOS + md.atime_nsec(),
            ctime_ns: md.ctime() * NANOS + md.ctime_nsec(),
            uid: md.uid(),
            gid: md.gid(),
            mode: md.mode(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let md = fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        Ok(Self::from_metadata(&md))
    }

    /// Pure function of the policy vector: true iff every enabled field
    /// matches. Content equality is the caller's responsibility.
    pub fn matches(&self, other: &FileMeta, policy: &MetadataPolicy) -> bool {
        if self.size != other.size {
            return false;
        }
        if policy.mtime && self.mtime_ns != other.mtime_ns {
            return false;
        }
        if policy.atime && self.atime_ns != other.atime_ns {
            return false;
        }
        if policy.ctime && self.ctime_ns != other.ctime_ns {
            return false;
        }
        if policy.owner && self.uid != other.uid {
            return false;
        }
        if policy.group && self.gid != other.gid {
            return false;
        }
        // Permission bits only; file type bits are always "regular" here.
        if policy.mode && self.mode & 0o7777 != other.mode & 0o7777 {
            return false;
        }
        true
    }
}
