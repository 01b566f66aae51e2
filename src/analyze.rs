/*
Classify external paths against the index and persist the verdicts as
report directories. A file input is hashed, probed against the buckets of
its digest, and byte-verified against one representative per bucket; every
bucket member then gets a metadata verdict under the active policy.

A directory input runs the file pipeline over every regular file inside
it (hashing in parallel), mirrors the per-file records under `files/`,
and aggregates matches per repository directory: every ancestor of a
matched member becomes a candidate, credited once per analyzed file.
*/

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::compare::files_equal;
use crate::error::Error;
use crate::hash::{hash_file, Digest};
use crate::index::keys::{bucket_prefix, parse_bucket_key, path_to_string, sig_prefix};
use crate::index::record::Bucket;
use crate::meta::{FileMeta, MetadataPolicy};
use crate::report::{DirDuplicate, FileDuplicate, ReportMeta, ReportWriter};
use crate::repository::Repository;
use crate::walker::walk;

pub struct Analyzer<'a> {
    repo: &'a Repository,
    policy: MetadataPolicy,
}

#[derive(Default)]
struct DirAgg {
    items: u64,
    size: u64,
    /// Analyzed files whose identical match sits at the corresponding
    /// relative position inside the candidate.
    positional: u64,
}

/// Proper ancestors of a repository-relative path string, nearest first,
/// ending with the repository root (empty string).
fn ancestors_of(member: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = member;
    while let Some(pos) = rest.rfind('/') {
        rest = &rest[..pos];
        out.push(rest.to_string());
    }
    out.push(String::new());
    out
}

impl<'a> Analyzer<'a> {
    pub fn new(repo: &'a Repository, policy: MetadataPolicy) -> Self {
        Self { repo, policy }
    }

    /// Analyze one input path, writing `<input>.report/` next to it.
    pub fn analyze(&self, input: &Path) -> Result<()> {
        let abs = input
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", input.display()))?;
        let md = fs::metadata(&abs)?;

        if md.is_file() {
            self.analyze_file(&abs)
        } else if md.is_dir() {
            self.analyze_dir(&abs)
        } else {
            Err(Error::Usage(format!(
                "{} is neither a regular file nor a directory",
                input.display()
            ))
            .into())
        }
    }

    fn meta_record(&self, abs: &Path, directory: bool) -> ReportMeta {
        let created_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        ReportMeta {
            created_ns,
            analyzed_path: abs.display().to_string(),
            repository_root: self.repo.root().display().to_string(),
            policy: self.policy,
            directory,
        }
    }

    /// Stat and hash one file; unreadable files classify as nothing.
    fn classify_file(&self, abs: &Path) -> Result<Option<(FileMeta, Vec<FileDuplicate>)>> {
        let meta = match FileMeta::read(abs) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("skipping {}: {err:#}", abs.display());
                return Ok(None);
            }
        };
        let digest = match hash_file(self.repo.algorithm(), abs) {
            Ok((digest, _)) => digest,
            Err(err) => {
                warn!("skipping {}: {err:#}", abs.display());
                return Ok(None);
            }
        };
        let records = self.probe(abs, &meta, &digest)?;
        Ok(Some((meta, records)))
    }

    /// Probe the index for one digest: byte-verify against a single
    /// representative per bucket, then judge each member's metadata.
    fn probe(
        &self,
        abs: &Path,
        input_meta: &FileMeta,
        digest: &Digest,
    ) -> Result<Vec<FileDuplicate>> {
        let store = self.repo.store();
        let root = self.repo.root();
        let mut records = Vec::new();

        for item in store.iter_prefix(&bucket_prefix(digest)) {
            let (key, value) = item?;
            let (_, ec_id) = parse_bucket_key(&key)?;
            let bucket = Bucket::from_bytes(&key, &value)?;

            let mut bytes_eq = None;
            for member in &bucket.paths {
                match files_equal(abs, &root.join(member)) {
                    Ok(eq) => {
                        bytes_eq = Some(eq);
                        break;
                    }
                    Err(err) => debug!("representative {member} unreadable: {err:#}"),
                }
            }
            // a bucket with no readable representative proves nothing
            let Some(bytes_eq) = bytes_eq else { continue };

            for member in &bucket.paths {
                let (identical, size) = match FileMeta::read(&root.join(member)) {
                    Ok(member_meta) => (
                        bytes_eq && input_meta.matches(&member_meta, &self.policy),
                        member_meta.size,
                    ),
                    Err(_) => (false, input_meta.size),
                };
                records.push(FileDuplicate {
                    path: member.clone(),
                    ec_id,
                    identical,
                    size,
                });
            }
        }
        Ok(records)
    }

    fn analyze_file(&self, abs: &Path) -> Result<()> {
        let Some((_, records)) = self.classify_file(abs)? else {
            anyhow::bail!("cannot read {}", abs.display());
        };

        let writer = ReportWriter::create(abs)?;
        writer.write_meta(&self.meta_record(abs, false))?;
        writer.write_file_duplicates(&records)?;
        info!(
            "analyze {}: {} duplicate records",
            abs.display(),
            records.len()
        );
        Ok(())
    }

    fn analyze_dir(&self, abs: &Path) -> Result<()> {
        let files: Vec<_> = walk(abs).collect();

        // hash and probe in parallel; the index is only read here
        let analyzed: Vec<(PathBuf, u64, Vec<FileDuplicate>)> = files
            .par_iter()
            .map(|file| {
                Ok(self
                    .classify_file(&file.abs)?
                    .map(|(meta, records)| (file.rel.clone(), meta.size, records)))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        let writer = ReportWriter::create(abs)?;
        writer.write_meta(&self.meta_record(abs, true))?;

        let total_files = analyzed.len() as u64;
        let mut aggs: BTreeMap<String, DirAgg> = BTreeMap::new();

        for (rel, size, records) in &analyzed {
            writer.write_leaf(rel, records)?;

            let rel_str = path_to_string(rel)?;
            let mut credited: HashSet<String> = HashSet::new();
            for record in records {
                for dir in ancestors_of(&record.path) {
                    if credited.insert(dir.clone()) {
                        let agg = aggs.entry(dir.clone()).or_default();
                        agg.items += 1;
                        agg.size += size;
                    }
                    let expected = if dir.is_empty() {
                        rel_str.clone()
                    } else {
                        format!("{dir}/{rel_str}")
                    };
                    if record.identical && record.path == expected {
                        aggs.entry(dir).or_default().positional += 1;
                    }
                }
            }
        }

        let mut dir_records = Vec::new();
        for (dir, agg) in &aggs {
            // identical: full coverage, at matching positions, and the
            // candidate holds nothing beyond the analyzed tree
            let identical = total_files > 0
                && agg.items == total_files
                && agg.positional == total_files
                && self.indexed_count_under(dir)? == total_files;
            dir_records.push(DirDuplicate {
                path: if dir.is_empty() { ".".into() } else { dir.clone() },
                items: agg.items,
                size: agg.size,
                identical,
            });
        }
        dir_records.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then(b.items.cmp(&a.items))
                .then(a.path.cmp(&b.path))
        });
        writer.write_dir_duplicates(&dir_records)?;

        info!(
            "analyze {}: {} files, {} candidate directories",
            abs.display(),
            total_files,
            dir_records.len()
        );
        Ok(())
    }

    /// Number of indexed files under a repository directory, straight off
    /// the `m:` prefix.
    fn indexed_count_under(&self, dir: &str) -> Result<u64> {
        let prefix = sig_prefix(Path::new(dir))?;
        let mut count = 0u64;
        for item in self.repo.store().iter_prefix(&prefix) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::builder::IndexBuilder;
    use crate::report::{find_enclosing, ReportReader};
    use std::fs::{File, FileTimes};
    use tempfile::TempDir;

    fn build_repo(root: &Path) -> Result<()> {
        let repo = Repository::open_for_rebuild(root, None)?;
        IndexBuilder::new(&repo).rebuild()?;
        Ok(())
    }

    fn copy_with_mtime(from: &Path, to: &Path) -> Result<()> {
        fs::copy(from, to)?;
        let mtime = fs::metadata(from)?.modified()?;
        let file = File::options().write(true).open(to)?;
        file.set_times(FileTimes::new().set_modified(mtime))?;
        Ok(())
    }

    #[test]
    fn test_ancestors_of() {
        assert_eq!(ancestors_of("a/b/c"), vec!["a/b", "a", ""]);
        assert_eq!(ancestors_of("x"), vec![""]);
    }

    #[test]
    fn test_single_identical_duplicate() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir(&root)?;
        fs::write(root.join("foo"), "shared content")?;
        build_repo(&root)?;

        let bar = temp_dir.path().join("bar");
        copy_with_mtime(&root.join("foo"), &bar)?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&bar)?;

        let reader = ReportReader::open(&bar).unwrap();
        let meta = reader.meta()?;
        assert!(!meta.directory);
        assert_eq!(meta.policy, MetadataPolicy::default());

        let records = reader.file_duplicates()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "foo");
        assert_eq!(records[0].ec_id, 0);
        assert!(records[0].identical);
        assert_eq!(records[0].size, "shared content".len() as u64);
        Ok(())
    }

    #[test]
    fn test_metadata_mismatch_downgrades_verdict() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir(&root)?;
        fs::write(root.join("foo"), "payload")?;
        build_repo(&root)?;

        // same bytes, different mtime
        let bar = temp_dir.path().join("bar");
        fs::write(&bar, "payload")?;
        let file = File::options().write(true).open(&bar)?;
        file.set_times(FileTimes::new().set_modified(UNIX_EPOCH))?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&bar)?;
        let records = ReportReader::open(&bar).unwrap().file_duplicates()?;
        assert_eq!(records.len(), 1);
        assert!(!records[0].identical);

        // turning mtime off restores the identical verdict
        let relaxed = MetadataPolicy {
            mtime: false,
            ..MetadataPolicy::default()
        };
        Analyzer::new(&repo, relaxed).analyze(&bar)?;
        let records = ReportReader::open(&bar).unwrap().file_duplicates()?;
        assert!(records[0].identical);
        Ok(())
    }

    #[test]
    fn test_unknown_content_has_no_records() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir(&root)?;
        fs::write(root.join("foo"), "indexed")?;
        build_repo(&root)?;

        let stranger = temp_dir.path().join("stranger");
        fs::write(&stranger, "never seen")?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&stranger)?;

        let records = ReportReader::open(&stranger).unwrap().file_duplicates()?;
        assert!(records.is_empty());
        Ok(())
    }

    #[test]
    fn test_every_bucket_member_is_recorded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir_all(root.join("b"))?;
        fs::write(root.join("a"), "twin")?;
        fs::write(root.join("b/c"), "twin")?;
        build_repo(&root)?;

        let input = temp_dir.path().join("input");
        fs::write(&input, "twin")?;

        let repo = Repository::open(&root)?;
        let relaxed = MetadataPolicy {
            mtime: false,
            ..MetadataPolicy::default()
        };
        Analyzer::new(&repo, relaxed).analyze(&input)?;

        let records = ReportReader::open(&input).unwrap().file_duplicates()?;
        let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b/c"]);
        assert!(records.iter().all(|r| r.identical));
        Ok(())
    }

    #[test]
    fn test_directory_aggregation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir_all(root.join("mirror"))?;
        fs::write(root.join("mirror/x"), "xx")?;
        fs::write(root.join("mirror/y"), "yyyy")?;
        fs::write(root.join("loose"), "unrelated")?;
        build_repo(&root)?;

        let input = temp_dir.path().join("input");
        fs::create_dir(&input)?;
        copy_with_mtime(&root.join("mirror/x"), &input.join("x"))?;
        copy_with_mtime(&root.join("mirror/y"), &input.join("y"))?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&input)?;

        let reader = ReportReader::open(&input).unwrap();
        assert!(reader.meta()?.directory);

        let dirs = reader.dir_duplicates()?;
        let mirror = dirs.iter().find(|d| d.path == "mirror").unwrap();
        assert_eq!(mirror.items, 2);
        assert_eq!(mirror.size, 6);
        assert!(mirror.identical);

        // the repository root also holds the matches, but not at the
        // corresponding positions and with an extra file besides
        let root_record = dirs.iter().find(|d| d.path == ".").unwrap();
        assert_eq!(root_record.items, 2);
        assert!(!root_record.identical);

        // per-file leaves mirror the analyzed tree
        assert_eq!(
            reader.leaves()?,
            vec![PathBuf::from("x"), PathBuf::from("y")]
        );
        let leaf = reader.leaf(Path::new("x"))?;
        assert_eq!(leaf.len(), 1);
        assert_eq!(leaf[0].path, "mirror/x");
        Ok(())
    }

    #[test]
    fn test_partial_directory_match() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir_all(root.join("mirror"))?;
        fs::write(root.join("mirror/x"), "xx")?;
        build_repo(&root)?;

        let input = temp_dir.path().join("input");
        fs::create_dir(&input)?;
        copy_with_mtime(&root.join("mirror/x"), &input.join("x"))?;
        fs::write(input.join("extra"), "only here")?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&input)?;

        let dirs = ReportReader::open(&input).unwrap().dir_duplicates()?;
        let mirror = dirs.iter().find(|d| d.path == "mirror").unwrap();
        assert_eq!(mirror.items, 1);
        assert_eq!(mirror.size, 2);
        assert!(!mirror.identical);
        Ok(())
    }

    #[test]
    fn test_empty_directory_input() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir(&root)?;
        build_repo(&root)?;

        let input = temp_dir.path().join("empty");
        fs::create_dir(&input)?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&input)?;

        let reader = ReportReader::open(&input).unwrap();
        assert!(reader.dir_duplicates()?.is_empty());
        assert!(reader.leaves()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_report_is_findable_from_inside() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir(&root)?;
        fs::write(root.join("foo"), "data")?;
        build_repo(&root)?;

        let input = temp_dir.path().join("tree");
        fs::create_dir_all(input.join("sub"))?;
        fs::write(input.join("sub/foo"), "data")?;

        let repo = Repository::open(&root)?;
        Analyzer::new(&repo, MetadataPolicy::default()).analyze(&input)?;

        let (reader, rel) = find_enclosing(&input.join("sub/foo")).unwrap();
        assert_eq!(rel, PathBuf::from("sub/foo"));
        assert_eq!(reader.leaf(&rel)?.len(), 1);
        Ok(())
    }
}
