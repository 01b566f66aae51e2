/*
Cross-repository import. Entries move from a source repository into the
current one with their paths shifted by the relative position of the two
roots: a nested source gets its prefix prepended, an enclosing source is
filtered down to the subtree and stripped. Anything else is rejected.

Imported files flow through the destination's resolver, so classes merge
or stay apart strictly by byte comparison, never by trusting the source's
ec_ids.
*/

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Error;
use crate::index::keys::{parse_sig_key, SIG_PREFIX};
use crate::index::record::FileSignature;
use crate::index::resolver::Resolver;
use crate::repository::{Repository, INDEX_DIR};

pub struct Importer<'a> {
    repo: &'a Repository,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: u64,
    pub skipped: u64,
}

enum Shift {
    /// Source root is inside this repository: prepend its position.
    Prepend(PathBuf),
    /// Source root encloses this repository: keep only our subtree and
    /// strip the prefix.
    Strip(PathBuf),
}

impl<'a> Importer<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub fn import(&self, source_root: &Path) -> Result<ImportStats> {
        // Settle the root relationship before touching the source store:
        // importing a repository into itself must fail cleanly, not
        // collide on the store's own lock.
        let src_root = source_root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", source_root.display()))?;
        if !src_root.join(INDEX_DIR).is_dir() {
            return Err(Error::RepositoryNotFound.into());
        }
        let dst_root = self.repo.root();
        let shift = if src_root == dst_root {
            return Err(Error::Usage("source repository is this repository".into()).into());
        } else if let Ok(rel) = src_root.strip_prefix(dst_root) {
            Shift::Prepend(rel.to_path_buf())
        } else if let Ok(rel) = dst_root.strip_prefix(&src_root) {
            Shift::Strip(rel.to_path_buf())
        } else {
            return Err(Error::Usage(format!(
                "{} is neither an ancestor nor a descendant of {}",
                src_root.display(),
                dst_root.display()
            ))
            .into());
        };

        let source = Repository::open_source(&src_root)?;
        if source.algorithm() != self.repo.algorithm() {
            return Err(Error::Usage(format!(
                "hash algorithm mismatch: source uses {}, this repository uses {}",
                source.algorithm(),
                self.repo.algorithm()
            ))
            .into());
        }

        let resolver = Resolver::new(self.repo.store(), dst_root);
        let mut stats = ImportStats::default();

        for item in source.store().iter_prefix(SIG_PREFIX) {
            let (key, value) = item?;
            let sig = FileSignature::from_bytes(&key, &value)?;
            let rel = parse_sig_key(&key)?;

            let mapped = match &shift {
                Shift::Prepend(prefix) => prefix.join(&rel),
                Shift::Strip(prefix) => match rel.strip_prefix(prefix) {
                    Ok(stripped) => stripped.to_path_buf(),
                    Err(_) => continue,
                },
            };

            let digest = sig.digest(&key)?;
            match resolver.commit(&mapped, &digest, sig.mtime_ns) {
                Ok(_) => stats.imported += 1,
                Err(err) => match err.downcast_ref::<Error>() {
                    Some(Error::FileUnreadable { .. }) => {
                        warn!("skipping {}: {err:#}", mapped.display());
                        stats.skipped += 1;
                    }
                    _ => return Err(err),
                },
            }
        }

        self.repo.store().flush()?;
        info!(
            "imported {} entries from {} ({} skipped)",
            stats.imported,
            src_root.display(),
            stats.skipped
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{hash_file, HashAlgorithm};
    use crate::index::builder::IndexBuilder;
    use crate::index::keys::{bucket_key, sig_key};
    use crate::index::record::Bucket;
    use std::fs;
    use tempfile::TempDir;

    fn rebuild(root: &Path) -> Result<()> {
        let repo = Repository::open_for_rebuild(root, None)?;
        IndexBuilder::new(&repo).rebuild()?;
        Ok(())
    }

    #[test]
    fn test_import_from_nested_repository_prepends_prefix() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let parent = temp_dir.path();

        // parent indexed while it only held `copy`
        fs::write(parent.join("copy"), "content")?;
        rebuild(parent)?;

        // then a child repository appears underneath with the same bytes
        fs::create_dir(parent.join("sub"))?;
        fs::write(parent.join("sub/file"), "content")?;
        rebuild(&parent.join("sub"))?;

        let repo = Repository::open(parent)?;
        let stats = Importer::new(&repo).import(&parent.join("sub"))?;
        assert_eq!(stats.imported, 1);

        // the imported entry carries the prefix and merged into the
        // existing class by byte comparison
        assert!(repo.store().contains(&sig_key(Path::new("sub/file"))?)?);
        let (digest, _) = hash_file(HashAlgorithm::Sha256, &parent.join("copy"))?;
        let bkey = bucket_key(&digest, 0);
        let bucket = Bucket::from_bytes(&bkey, &repo.store().get(&bkey)?.unwrap())?;
        assert_eq!(bucket.paths, vec!["copy", "sub/file"]);
        Ok(())
    }

    #[test]
    fn test_import_from_enclosing_repository_strips_prefix() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let parent = temp_dir.path();

        fs::create_dir(parent.join("sub"))?;
        fs::write(parent.join("sub/file"), "inner")?;
        fs::write(parent.join("top"), "outer")?;
        rebuild(parent)?;

        // the child indexes its own file, then forgets it so the import
        // visibly restores the entry
        rebuild(&parent.join("sub"))?;
        {
            let child = Repository::open(&parent.join("sub"))?;
            let key = sig_key(Path::new("file"))?;
            child.store().delete(&key)?;
            let (digest, _) = hash_file(HashAlgorithm::Sha256, &parent.join("sub/file"))?;
            child.store().delete(&bucket_key(&digest, 0))?;
            child.store().flush()?;
        }

        let child = Repository::open(&parent.join("sub"))?;
        let stats = Importer::new(&child).import(parent)?;
        assert_eq!(stats.imported, 1);

        // `sub/file` arrived as `file`; `top` was filtered out
        assert!(child.store().contains(&sig_key(Path::new("file"))?)?);
        assert!(!child.store().contains(&sig_key(Path::new("top"))?)?);
        Ok(())
    }

    #[test]
    fn test_import_rejects_unrelated_and_self() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        fs::create_dir_all(&a)?;
        fs::create_dir_all(&b)?;
        rebuild(&a)?;
        rebuild(&b)?;

        let repo = Repository::open(&a)?;
        let err = Importer::new(&repo).import(&b).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);

        let err = Importer::new(&repo).import(&a).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
        Ok(())
    }

    #[test]
    fn test_import_rejects_algorithm_mismatch() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let parent = temp_dir.path();
        fs::create_dir(parent.join("sub"))?;
        rebuild(parent)?;
        {
            let child =
                Repository::open_for_rebuild(&parent.join("sub"), Some(HashAlgorithm::Blake3))?;
            IndexBuilder::new(&child).rebuild()?;
        }

        let repo = Repository::open(parent)?;
        let err = Importer::new(&repo).import(&parent.join("sub")).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
        assert!(err.to_string().contains("mismatch"));
        Ok(())
    }

    #[test]
    fn test_import_skips_files_missing_on_disk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let parent = temp_dir.path();
        rebuild(parent)?;

        fs::create_dir(parent.join("sub"))?;
        fs::write(parent.join("sub/gone"), "here for a moment")?;
        rebuild(&parent.join("sub"))?;
        fs::remove_file(parent.join("sub/gone"))?;

        let repo = Repository::open(parent)?;
        let stats = Importer::new(&repo).import(&parent.join("sub"))?;
        // with no prior class the entry lands without any comparison, so
        // the index records it; a later refresh prunes the dead path
        assert_eq!(stats.imported, 1);
        assert_eq!(stats.skipped, 0);
        assert!(repo.store().contains(&sig_key(Path::new("sub/gone"))?)?);
        let refreshed = IndexBuilder::new(&repo).refresh()?;
        assert_eq!(refreshed.removed, 1);
        Ok(())
    }
}
