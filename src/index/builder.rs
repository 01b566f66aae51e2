/*
Rebuild and refresh drive the whole indexing pipeline: walk the tree,
hash what changed on a worker pool, and feed a single writer that owns
every store mutation through the resolver.

Rebuild runs the truncation protocol: the in-store marker goes down first,
the old index is destroyed, and only after the post-truncation pass
completes is the marker lifted. A crash in between leaves the marker in
place, which every other command refuses to touch.
*/

use anyhow::Result;
use crossbeam_channel::bounded;
use std::collections::HashSet;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::hash::{hash_file, Digest, HashAlgorithm};
use crate::index::keys::{
    bucket_key, config_key, parse_sig_key, path_to_string, sig_key, CONFIG_HASH_ALGORITHM,
    CONFIG_TRUNCATING, SIG_PREFIX, TRUNCATING_VALUE,
};
use crate::index::record::{Bucket, FileSignature};
use crate::index::resolver::Resolver;
use crate::index::store::WriteBatch;
use crate::meta::mtime_ns;
use crate::repository::Repository;
use crate::walker::walk;

const QUEUE_DEPTH: usize = 256;
const MAX_WORKERS: usize = 8;
const DELETE_CHUNK: usize = 1024;

pub struct IndexBuilder<'a> {
    repo: &'a Repository,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    /// Files hashed and placed into a class this run.
    pub indexed: u64,
    /// Files whose signature already matched on-disk mtime.
    pub unchanged: u64,
    /// Signatures removed because the file is gone.
    pub removed: u64,
    /// Files left without a class: unreadable or never quiescent.
    pub unresolved: u64,
}

struct PendingFile {
    rel: PathBuf,
    abs: PathBuf,
}

enum Hashed {
    Stable {
        rel: PathBuf,
        digest: Digest,
        mtime_ns: i64,
    },
    Unstable {
        rel: PathBuf,
        digest: Digest,
        mtime_ns: i64,
    },
    Failed,
}

/// Hash with mtime sampled before and after; one retry when the file
/// moves underneath the read.
fn hash_stable(algorithm: HashAlgorithm, abs: &Path) -> Result<(Digest, i64, bool)> {
    let before = mtime_ns(&fs::metadata(abs)?);
    let (digest, _) = hash_file(algorithm, abs)?;
    let after = mtime_ns(&fs::metadata(abs)?);
    if before == after {
        return Ok((digest, before, true));
    }

    let before = after;
    let (digest, _) = hash_file(algorithm, abs)?;
    let after = mtime_ns(&fs::metadata(abs)?);
    Ok((digest, after, before == after))
}

impl<'a> IndexBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Destroy and re-create the index under the truncation marker. The
    /// only operation permitted to change the hash algorithm.
    pub fn rebuild(&self) -> Result<RefreshStats> {
        let store = self.repo.store();
        let algo_key = config_key(CONFIG_HASH_ALGORITHM);
        let marker_key = config_key(CONFIG_TRUNCATING);

        store.put(&marker_key, TRUNCATING_VALUE)?;
        store.flush()?;

        // Collect first, then delete: prefix iteration must not observe
        // its own removals.
        let doomed: Vec<Vec<u8>> = store
            .iter_prefix(b"")
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|k| *k != algo_key && *k != marker_key)
            .collect();

        let mut batch = WriteBatch::default();
        for key in doomed {
            batch.delete(&key);
            if batch.len() >= DELETE_CHUNK {
                store.apply(mem::take(&mut batch))?;
            }
        }
        store.apply(batch)?;

        store.put(&algo_key, self.repo.algorithm().name().as_bytes())?;
        info!(
            "rebuilding index of {} with {}",
            self.repo.root().display(),
            self.repo.algorithm()
        );

        let stats = self.refresh_pass()?;

        store.delete(&marker_key)?;
        store.flush()?;
        Ok(stats)
    }

    /// Incremental update: re-hash what moved, prune what vanished.
    pub fn refresh(&self) -> Result<RefreshStats> {
        let stats = self.refresh_pass()?;
        self.repo.store().flush()?;
        Ok(stats)
    }

    fn refresh_pass(&self) -> Result<RefreshStats> {
        let store = self.repo.store();
        let root = self.repo.root();
        let mut stats = RefreshStats::default();

        // Phase 1 — discover: stat before anything else, then compare
        // against the stored signature.
        let mut pending = Vec::new();
        let mut on_disk = HashSet::new();
        for file in walk(root) {
            let key = match sig_key(&file.rel) {
                Ok(key) => key,
                Err(err) => {
                    warn!("skipping {}: {err}", file.rel.display());
                    continue;
                }
            };
            let mtime = match fs::metadata(&file.abs) {
                Ok(md) => mtime_ns(&md),
                Err(err) => {
                    warn!("skipping {}: {err}", file.abs.display());
                    continue;
                }
            };
            on_disk.insert(key.clone());

            let fresh = match store.get(&key)? {
                Some(value) => {
                    let sig = FileSignature::from_bytes(&key, &value)?;
                    sig.ec_id.is_some() && sig.mtime_ns == mtime
                }
                None => false,
            };
            if fresh {
                stats.unchanged += 1;
            } else {
                pending.push(PendingFile {
                    rel: file.rel,
                    abs: file.abs,
                });
            }
        }

        self.prune(&on_disk, &mut stats)?;

        if !pending.is_empty() {
            self.resolve_pending(pending, &mut stats)?;
        }

        info!(
            "refresh: {} indexed, {} unchanged, {} removed, {} unresolved",
            stats.indexed, stats.unchanged, stats.removed, stats.unresolved
        );
        Ok(stats)
    }

    /// Drop signatures whose file is no longer on disk, removing each
    /// path from its bucket in the same batch.
    fn prune(&self, on_disk: &HashSet<Vec<u8>>, stats: &mut RefreshStats) -> Result<()> {
        let store = self.repo.store();

        let stale: Vec<(Vec<u8>, Vec<u8>)> = store
            .iter_prefix(SIG_PREFIX)
            .filter(|item| match item {
                Ok((key, _)) => !on_disk.contains(key),
                Err(_) => true,
            })
            .collect::<Result<Vec<_>>>()?;

        for (key, value) in stale {
            let sig = FileSignature::from_bytes(&key, &value)?;
            let rel = parse_sig_key(&key)?;
            let mut batch = WriteBatch::default();
            batch.delete(&key);

            if let Some(ec_id) = sig.ec_id {
                let digest = sig.digest(&key)?;
                let bkey = bucket_key(&digest, ec_id);
                let mut bucket = match store.get(&bkey)? {
                    Some(bytes) => Bucket::from_bytes(&bkey, &bytes)?,
                    None => {
                        return Err(
                            Error::corrupt(&key, "signature points at a missing bucket").into()
                        )
                    }
                };
                bucket.remove(&path_to_string(&rel)?);
                if bucket.is_empty() {
                    batch.delete(&bkey);
                } else {
                    batch.put(&bkey, &bucket.to_bytes()?);
                }
            }

            store.apply(batch)?;
            stats.removed += 1;
            debug!("pruned {}", rel.display());
        }
        Ok(())
    }

    /// Phase 2 — hash on a bounded worker pool; resolve and write on this
    /// thread only.
    fn resolve_pending(&self, pending: Vec<PendingFile>, stats: &mut RefreshStats) -> Result<()> {
        let store = self.repo.store();
        let root = self.repo.root();
        let algorithm = self.repo.algorithm();
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .min(MAX_WORKERS);

        thread::scope(|scope| -> Result<()> {
            let (work_tx, work_rx) = bounded::<PendingFile>(QUEUE_DEPTH);
            let (done_tx, done_rx) = bounded::<Hashed>(QUEUE_DEPTH);

            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for file in work_rx {
                        let msg = match hash_stable(algorithm, &file.abs) {
                            Ok((digest, mtime_ns, true)) => Hashed::Stable {
                                rel: file.rel,
                                digest,
                                mtime_ns,
                            },
                            Ok((digest, mtime_ns, false)) => Hashed::Unstable {
                                rel: file.rel,
                                digest,
                                mtime_ns,
                            },
                            Err(err) => {
                                warn!("failed to hash {}: {err:#}", file.abs.display());
                                Hashed::Failed
                            }
                        };
                        if done_tx.send(msg).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(done_tx);

            scope.spawn(move || {
                for file in pending {
                    if work_tx.send(file).is_err() {
                        break;
                    }
                }
            });

            let resolver = Resolver::new(store, root);
            for msg in done_rx {
                match msg {
                    Hashed::Stable {
                        rel,
                        digest,
                        mtime_ns,
                    } => {
                        // Mid-operation window: the signature lands without
                        // its class, then the resolver completes it.
                        resolver.begin(&rel, &digest, mtime_ns)?;
                        match resolver.commit(&rel, &digest, mtime_ns) {
                            Ok(_) => stats.indexed += 1,
                            Err(err) => match err.downcast_ref::<Error>() {
                                Some(Error::FileUnreadable { .. }) => {
                                    warn!("could not resolve {}: {err:#}", rel.display());
                                    store.delete(&sig_key(&rel)?)?;
                                    stats.unresolved += 1;
                                }
                                _ => return Err(err),
                            },
                        }
                    }
                    Hashed::Unstable {
                        rel,
                        digest,
                        mtime_ns,
                    } => {
                        warn!(
                            "{} kept changing while hashing; left without a class",
                            rel.display()
                        );
                        resolver.begin(&rel, &digest, mtime_ns)?;
                        stats.unresolved += 1;
                    }
                    Hashed::Failed => stats.unresolved += 1,
                }
            }
            Ok(())
        })
    }
}
