/*
Persistent report directories written by the analyzer and consumed by
describe and diff-tree. A report lives at `<input>.report/` next to the
analyzed input:

  meta         what was analyzed, against which repository, under which
               metadata policy
  duplicates   ordered duplicate records, file- or directory-shaped
  files/       (directory inputs) mirror of the analyzed tree, one leaf
               of file-shaped records per analyzed file

Every file uses the same MessagePack encoding as the index records.
*/

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::meta::MetadataPolicy;

pub const REPORT_SUFFIX: &str = ".report";

const META_FILE: &str = "meta";
const DUPLICATES_FILE: &str = "duplicates";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub created_ns: i64,
    pub analyzed_path: String,
    pub repository_root: String,
    pub policy: MetadataPolicy,
    pub directory: bool,
}

/// Duplicate record for a file input (or one leaf of a directory input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDuplicate {
    pub path: String,
    pub ec_id: u32,
    pub identical: bool,
    pub size: u64,
}

/// Directory-level aggregate for a directory input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirDuplicate {
    pub path: String,
    pub items: u64,
    pub size: u64,
    pub identical: bool,
}

/// `<input>.report`, adjacent to the input.
pub fn report_dir(input: &Path) -> PathBuf {
    let mut os = input.as_os_str().to_os_string();
    os.push(REPORT_SUFFIX);
    PathBuf::from(os)
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = rmp_serde::to_vec(value)?;
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    rmp_serde::from_slice(&bytes)
        .with_context(|| format!("Failed to decode report file {}", path.display()))
}

pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    /// Create (replacing any previous report) the report directory for an
    /// input.
    pub fn create(input: &Path) -> Result<Self> {
        let dir = report_dir(input);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to replace report {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create report {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn write_meta(&self, meta: &ReportMeta) -> Result<()> {
        write_record(&self.dir.join(META_FILE), meta)
    }

    pub fn write_file_duplicates(&self, records: &[FileDuplicate]) -> Result<()> {
        write_record(&self.dir.join(DUPLICATES_FILE), &records)
    }

    pub fn write_dir_duplicates(&self, records: &[DirDuplicate]) -> Result<()> {
        write_record(&self.dir.join(DUPLICATES_FILE), &records)
    }

    /// One leaf under `files/` mirroring the analyzed tree.
    pub fn write_leaf(&self, rel: &Path, records: &[FileDuplicate]) -> Result<()> {
        let path = self.dir.join(FILES_DIR).join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        write_record(&path, &records)
    }
}

pub struct ReportReader {
    dir: PathBuf,
}

impl ReportReader {
    /// Open the report for `input` if one exists.
    pub fn open(input: &Path) -> Option<Self> {
        let dir = report_dir(input);
        dir.is_dir().then_some(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> Result<ReportMeta> {
        read_record(&self.dir.join(META_FILE))
    }

    pub fn file_duplicates(&self) -> Result<Vec<FileDuplicate>> {
        read_record(&self.dir.join(DUPLICATES_FILE))
    }

    pub fn dir_duplicates(&self) -> Result<Vec<DirDuplicate>> {
        read_record(&self.dir.join(DUPLICATES_FILE))
    }

    pub fn leaf(&self, rel: &Path) -> Result<Vec<FileDuplicate>> {
        read_record(&self.dir.join(FILES_DIR).join(rel))
    }

    /// Relative paths of every leaf in the `files/` mirror, sorted.
    pub fn leaves(&self) -> Result<Vec<PathBuf>> {
        let files = self.dir.join(FILES_DIR);
        if !files.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&files).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                out.push(entry.path().strip_prefix(&files)?.to_path_buf());
            }
        }
        Ok(out)
    }
}

/// Upward search for the nearest enclosing report: the input itself first,
/// then each ancestor. Returns the reader and the position of `path`
/// inside the analyzed tree (empty for the analyzed input itself).
pub fn find_enclosing(path: &Path) -> Option<(ReportReader, PathBuf)> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if let Some(reader) = ReportReader::open(candidate) {
            let rel = path
                .strip_prefix(candidate)
                .unwrap_or_else(|_| Path::new(""))
                .to_path_buf();
            return Some((reader, rel));
        }
        current = candidate.parent();
    }
    None
}
