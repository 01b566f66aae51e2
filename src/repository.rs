/*
Repository discovery and lifetimes. A repository is any directory whose
root carries a `.rededup/` index directory holding the KV store and an
advisory lock file. Discovery order: explicit path, then the
REDEDUP_REPOSITORY environment variable, then ascent from the current
directory.
*/

use anyhow::{Context, Result};
use fs2::FileExt;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;
use crate::hash::HashAlgorithm;
use crate::index::keys::{config_key, CONFIG_HASH_ALGORITHM, CONFIG_TRUNCATING};
use crate::index::store::Store;

pub const INDEX_DIR: &str = ".rededup";
pub const ENV_REPOSITORY: &str = "REDEDUP_REPOSITORY";

const STORE_DIR: &str = "store";
const LOCK_FILE: &str = "lock";

#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    store: Store,
    algorithm: HashAlgorithm,
    // Held for the lifetime of the handle; dropping releases the lock.
    _lock: Option<File>,
}

/// Locate the repository root without opening it.
pub fn discover(explicit: Option<&Path>) -> Result<PathBuf> {
    let env_root = env::var(ENV_REPOSITORY).ok().filter(|v| !v.is_empty());
    let cwd = env::current_dir().context("Failed to read current directory")?;
    discover_impl(explicit, env_root.map(PathBuf::from), &cwd)
}

fn discover_impl(
    explicit: Option<&Path>,
    env_root: Option<PathBuf>,
    cwd: &Path,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env_root {
        return Ok(path);
    }
    for dir in cwd.ancestors() {
        if dir.join(INDEX_DIR).is_dir() {
            debug!("discovered repository at {}", dir.display());
            return Ok(dir.to_path_buf());
        }
    }
    Err(Error::RepositoryNotFound.into())
}

fn acquire_lock(index_dir: &Path) -> Result<File> {
    let path = index_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another rededup process is working on this repository ({})",
            path.display()
        )
    })?;
    Ok(file)
}

fn read_algorithm(store: &Store) -> Result<HashAlgorithm> {
    let key = config_key(CONFIG_HASH_ALGORITHM);
    match store.get(&key)? {
        Some(value) => {
            let name = std::str::from_utf8(&value)
                .map_err(|_| Error::corrupt(&key, "non-UTF-8 hash algorithm"))?;
            name.parse()
                .map_err(|_| Error::corrupt(&key, format!("unknown hash algorithm {name:?}")).into())
        }
        None => Err(Error::Usage(
            "index has no hash algorithm recorded; run `rededup rebuild`".into(),
        )
        .into()),
    }
}

impl Repository {
    /// Open an existing repository for any command except `rebuild`.
    /// Fails if the index is mid-truncation or missing its configuration.
    pub fn open(root: &Path) -> Result<Self> {
        let index_dir = root.join(INDEX_DIR);
        if !index_dir.is_dir() {
            return Err(Error::RepositoryNotFound.into());
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;

        let lock = acquire_lock(&index_dir)?;
        let store = Store::open(&index_dir.join(STORE_DIR))?;

        if store.contains(&config_key(CONFIG_TRUNCATING))? {
            return Err(Error::Truncating.into());
        }
        let algorithm = read_algorithm(&store)?;

        Ok(Self {
            root,
            store,
            algorithm,
            _lock: Some(lock),
        })
    }

    /// Open (creating `.rededup/` if needed) for `rebuild`. A leftover
    /// truncation marker is accepted here; rebuild is its recovery path.
    pub fn open_for_rebuild(root: &Path, requested: Option<HashAlgorithm>) -> Result<Self> {
        let index_dir = root.join(INDEX_DIR);
        fs::create_dir_all(&index_dir)
            .with_context(|| format!("Failed to create {}", index_dir.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;

        let lock = acquire_lock(&index_dir)?;
        let store = Store::open(&index_dir.join(STORE_DIR))?;

        let algorithm = match requested {
            Some(algo) => algo,
            None => read_algorithm(&store).unwrap_or_default(),
        };

        Ok(Self {
            root,
            store,
            algorithm,
            _lock: Some(lock),
        })
    }

    /// Read-only open of another repository, used as the source side of
    /// `import`. Takes no advisory lock and must never write.
    pub fn open_source(root: &Path) -> Result<Self> {
        let index_dir = root.join(INDEX_DIR);
        if !index_dir.is_dir() {
            return Err(Error::RepositoryNotFound.into());
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;
        let store = Store::open(&index_dir.join(STORE_DIR))?;

        if store.contains(&config_key(CONFIG_TRUNCATING))? {
            return Err(Error::Truncating.into());
        }
        let algorithm = read_algorithm(&store)?;

        Ok(Self {
            root,
            store,
            algorithm,
            _lock: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_precedence() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/b"))?;
        fs::create_dir_all(root.join(INDEX_DIR))?;

        // explicit wins over everything
        let explicit = discover_impl(
            Some(Path::new("/explicit")),
            Some(PathBuf::from("/env")),
            &root.join("a/b"),
        )?;
        assert_eq!(explicit, PathBuf::from("/explicit"));

        // then the environment override
        let env = discover_impl(None, Some(PathBuf::from("/env")), &root.join("a/b"))?;
        assert_eq!(env, PathBuf::from("/env"));

        // then ascent to the nearest `.rededup`
        let ascended = discover_impl(None, None, &root.join("a/b"))?;
        assert_eq!(ascended, root);
        Ok(())
    }

    #[test]
    fn test_discover_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = discover_impl(None, None, temp_dir.path()).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn test_open_requires_index_dir() {
        let temp_dir = TempDir::new().unwrap();
        let err = Repository::open(temp_dir.path()).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn test_open_for_rebuild_creates_layout() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let repo = Repository::open_for_rebuild(temp_dir.path(), None)?;

        assert_eq!(repo.algorithm(), HashAlgorithm::Sha256);
        assert!(temp_dir.path().join(INDEX_DIR).is_dir());
        assert!(temp_dir.path().join(INDEX_DIR).join(LOCK_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_open_refuses_missing_algorithm() -> Result<()> {
        let temp_dir = TempDir::new()?;
        // create the layout but never record a configuration
        drop(Repository::open_for_rebuild(temp_dir.path(), None)?);

        let err = Repository::open(temp_dir.path()).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
        assert!(err.to_string().contains("rebuild"));
        Ok(())
    }

    #[test]
    fn test_open_refuses_truncating_state() -> Result<()> {
        let temp_dir = TempDir::new()?;
        {
            let repo = Repository::open_for_rebuild(temp_dir.path(), None)?;
            repo.store()
                .put(&config_key(CONFIG_TRUNCATING), b"truncate")?;
            repo.store().flush()?;
        }

        let err = Repository::open(temp_dir.path()).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 4);

        // rebuild still gets in
        assert!(Repository::open_for_rebuild(temp_dir.path(), None).is_ok());
        Ok(())
    }

    #[test]
    fn test_second_open_is_excluded() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let _first = Repository::open_for_rebuild(temp_dir.path(), None)?;
        assert!(Repository::open_for_rebuild(temp_dir.path(), None).is_err());
        Ok(())
    }

    #[test]
    fn test_requested_algorithm_overrides_stored() -> Result<()> {
        let temp_dir = TempDir::new()?;
        {
            let repo = Repository::open_for_rebuild(temp_dir.path(), None)?;
            repo.store().put(
                &config_key(CONFIG_HASH_ALGORITHM),
                HashAlgorithm::Sha256.name().as_bytes(),
            )?;
            repo.store().flush()?;
        }

        let repo = Repository::open_for_rebuild(temp_dir.path(), Some(HashAlgorithm::Blake3))?;
        assert_eq!(repo.algorithm(), HashAlgorithm::Blake3);
        Ok(())
    }
}
