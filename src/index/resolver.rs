/*
Equivalent-class resolution. A freshly hashed file is placed into the
class whose representative it matches byte for byte, probing buckets in
ascending ec_id so the outcome is deterministic for a fixed store state.
The bucket update and the completed signature land in one atomic batch.

Hash equality never merges classes on its own; the byte comparison here is
the proof. Under an honest hash the per-digest bucket count is one and a
single comparison is paid per already-known digest.
*/

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};

use crate::compare::readers_equal;
use crate::error::Error;
use crate::hash::Digest;
use crate::index::keys::{bucket_key, bucket_prefix, parse_bucket_key, path_to_string, sig_key};
use crate::index::record::{Bucket, FileSignature};
use crate::index::store::{Store, WriteBatch};

pub struct Resolver<'a> {
    store: &'a Store,
    root: &'a Path,
}

/// Outcome of comparing the candidate against one bucket member.
/// `None` means the member could not be opened and should be pruned.
fn byte_matches(candidate: &Path, member: &Path) -> Result<Option<bool>> {
    let member_file = match File::open(member) {
        Ok(f) => f,
        Err(err) => {
            warn!(
                "bucket member {} is unreadable, pruning: {err}",
                member.display()
            );
            return Ok(None);
        }
    };
    let candidate_file = File::open(candidate).map_err(|source| Error::FileUnreadable {
        path: candidate.to_path_buf(),
        source,
    })?;
    let eq = readers_equal(candidate_file, member_file).with_context(|| {
        format!(
            "Failed to compare {} and {}",
            candidate.display(),
            member.display()
        )
    })?;
    Ok(Some(eq))
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a Store, root: &'a Path) -> Self {
        Self { store, root }
    }

    /// A previous signature under another digest means the content moved:
    /// take the path out of its old class within the caller's batch.
    fn detach_stale(
        &self,
        batch: &mut WriteBatch,
        skey: &[u8],
        rel_str: &str,
        digest: &Digest,
    ) -> Result<()> {
        let Some(value) = self.store.get(skey)? else {
            return Ok(());
        };
        let old = FileSignature::from_bytes(skey, &value)?;
        let Some(old_ec) = old.ec_id else {
            return Ok(());
        };
        let old_digest = old.digest(skey)?;
        if old_digest == *digest {
            return Ok(());
        }
        let bkey = bucket_key(&old_digest, old_ec);
        if let Some(bytes) = self.store.get(&bkey)? {
            let mut bucket = Bucket::from_bytes(&bkey, &bytes)?;
            if bucket.remove(rel_str) {
                if bucket.is_empty() {
                    batch.delete(&bkey);
                } else {
                    batch.put(&bkey, &bucket.to_bytes()?);
                }
            }
        }
        Ok(())
    }

    /// Record a freshly hashed file without a class yet, leaving any
    /// previous class in the same batch. This is the mid-operation state
    /// a subsequent `commit` (or the next refresh) completes.
    pub fn begin(&self, rel: &Path, digest: &Digest, mtime_ns: i64) -> Result<()> {
        let rel_str = path_to_string(rel)?;
        let skey = sig_key(rel)?;
        let mut batch = WriteBatch::default();
        self.detach_stale(&mut batch, &skey, &rel_str, digest)?;
        batch.put(
            &skey,
            &FileSignature::new(*digest, mtime_ns, None).to_bytes()?,
        );
        self.store.apply(batch)
    }

    /// Place `rel` (already hashed to `digest`) into its equivalent class
    /// and commit the completed signature. Returns the assigned ec_id.
    pub fn commit(&self, rel: &Path, digest: &Digest, mtime_ns: i64) -> Result<u32> {
        let rel_str = path_to_string(rel)?;
        let candidate_abs = self.root.join(rel);
        let skey = sig_key(rel)?;
        let mut batch = WriteBatch::default();
        self.detach_stale(&mut batch, &skey, &rel_str, digest)?;

        let mut buckets = Vec::new();
        for item in self.store.iter_prefix(&bucket_prefix(digest)) {
            let (key, value) = item?;
            let (_, ec_id) = parse_bucket_key(&key)?;
            buckets.push((ec_id, Bucket::from_bytes(&key, &value)?));
        }

        let mut target = None;
        for (ec_id, bucket) in buckets.iter_mut() {
            let was_member = bucket.contains(&rel_str);
            let mut dirty = false;

            // One comparison against the first readable member other than
            // the candidate itself; dead members are pruned on the way.
            let mut verdict = None;
            for member in bucket.paths.clone() {
                if member == rel_str {
                    continue;
                }
                match byte_matches(&candidate_abs, &self.root.join(&member))? {
                    Some(eq) => {
                        verdict = Some(eq);
                        break;
                    }
                    None => {
                        bucket.remove(&member);
                        batch.delete(&sig_key(Path::new(&member))?);
                        dirty = true;
                    }
                }
            }

            // With no other readable member left, prior membership stands:
            // a class of one is byte-identical to itself.
            let joins = verdict.unwrap_or(was_member);

            if joins {
                if !was_member {
                    bucket.insert(&rel_str);
                    dirty = true;
                }
                if dirty {
                    batch.put(&bucket_key(digest, *ec_id), &bucket.to_bytes()?);
                }
                target = Some(*ec_id);
                break;
            }

            // Content moved away from this class (possible only under
            // colliding digests): drop the stale membership.
            if was_member {
                bucket.remove(&rel_str);
                dirty = true;
            }
            if dirty {
                let key = bucket_key(digest, *ec_id);
                if bucket.is_empty() {
                    batch.delete(&key);
                } else {
                    batch.put(&key, &bucket.to_bytes()?);
                }
            }
        }

        let ec_id = match target {
            Some(id) => id,
            None => {
                // Smallest id not used by any surviving bucket of this digest.
                let mut used: Vec<u32> = buckets
                    .iter()
                    .filter(|(_, b)| !b.is_empty())
                    .map(|(id, _)| *id)
                    .collect();
                used.sort_unstable();
                let mut id = 0u32;
                for u in used {
                    if u == id {
                        id += 1;
                    } else if u > id {
                        break;
                    }
                }
                debug!("new equivalent class {} for {}", id, rel_str);
                batch.put(&bucket_key(digest, id), &Bucket::single(rel_str.clone()).to_bytes()?);
                id
            }
        };

        batch.put(
            &skey,
            &FileSignature::new(*digest, mtime_ns, Some(ec_id)).to_bytes()?,
        );
        self.store.apply(batch)?;
        Ok(ec_id)
    }
}
