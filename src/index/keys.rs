/*
Key layout for the three index key spaces.

  c:<name>                      configuration string
  h:<digest><ec_id_be32>        equivalent-class bucket
  m:<p1>\0<p2>\0...\0<pN>\0     file signature, path split on the
                                separator and null-joined

The trailing null after the final component keeps `m:a\0b\0` from being a
prefix of `m:ab\0`, so a directory's encoded form is exactly the prefix
that enumerates its descendants. `ec_id` is big-endian so lexicographic
key order equals numeric order.
*/

use crate::error::Error;
use crate::hash::{Digest, DIGEST_LEN};
use anyhow::Result;
use std::path::{Component, Path, PathBuf};

pub const CONFIG_PREFIX: &[u8] = b"c:";
pub const BUCKET_PREFIX: &[u8] = b"h:";
pub const SIG_PREFIX: &[u8] = b"m:";

pub const CONFIG_HASH_ALGORITHM: &str = "hash-algorithm";
pub const CONFIG_TRUNCATING: &str = "truncating";
pub const TRUNCATING_VALUE: &[u8] = b"truncate";

const SEPARATOR: u8 = 0;

/// Split a repository-relative path into validated UTF-8 components.
fn components(path: &Path) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(os) => {
                let s = os
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("non-UTF-8 path: {}", path.display()))?;
                if s.is_empty() {
                    anyhow::bail!("empty component in path: {}", path.display());
                }
                if s.as_bytes().contains(&SEPARATOR) {
                    anyhow::bail!("null byte in path: {}", path.display());
                }
                out.push(s);
            }
            Component::CurDir | Component::ParentDir => {
                anyhow::bail!("`.` and `..` are not allowed in {}", path.display())
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("path is not repository-relative: {}", path.display())
            }
        }
    }
    Ok(out)
}

/// Encode a relative path as null-joined components with a trailing
/// terminator. Rejects empty paths.
pub fn encode_path(path: &Path) -> Result<Vec<u8>> {
    let comps = components(path)?;
    if comps.is_empty() {
        anyhow::bail!("empty path");
    }
    let mut out = Vec::with_capacity(path.as_os_str().len() + comps.len());
    for comp in comps {
        out.extend_from_slice(comp.as_bytes());
        out.push(SEPARATOR);
    }
    Ok(out)
}

/// Inverse of `encode_path`.
pub fn decode_path(bytes: &[u8]) -> Result<PathBuf> {
    if bytes.last() != Some(&SEPARATOR) {
        anyhow::bail!("encoded path missing terminator");
    }
    let mut out = PathBuf::new();
    for comp in bytes[..bytes.len() - 1].split(|b| *b == SEPARATOR) {
        if comp.is_empty() {
            anyhow::bail!("empty component in encoded path");
        }
        out.push(std::str::from_utf8(comp).map_err(|_| anyhow::anyhow!("non-UTF-8 component"))?);
    }
    Ok(out)
}

/// `m:` key for a file's signature.
pub fn sig_key(path: &Path) -> Result<Vec<u8>> {
    let mut key = SIG_PREFIX.to_vec();
    key.extend_from_slice(&encode_path(path)?);
    Ok(key)
}

/// `m:` prefix covering every file under `dir` at any depth. The
/// repository root maps to the bare prefix.
pub fn sig_prefix(dir: &Path) -> Result<Vec<u8>> {
    let mut key = SIG_PREFIX.to_vec();
    if dir.as_os_str().is_empty() {
        return Ok(key);
    }
    key.extend_from_slice(&encode_path(dir)?);
    Ok(key)
}

/// Path back out of an `m:` key.
pub fn parse_sig_key(key: &[u8]) -> Result<PathBuf> {
    let encoded = key
        .strip_prefix(SIG_PREFIX)
        .ok_or_else(|| Error::corrupt(key, "not in the m: key space"))?;
    decode_path(encoded).map_err(|e| Error::corrupt(key, e.to_string()).into())
}

/// `h:` key for one equivalent class.
pub fn bucket_key(digest: &Digest, ec_id: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(BUCKET_PREFIX.len() + DIGEST_LEN + 4);
    key.extend_from_slice(BUCKET_PREFIX);
    key.extend_from_slice(digest);
    key.extend_from_slice(&ec_id.to_be_bytes());
    key
}

/// `h:` prefix covering every class of one digest, in ascending `ec_id`
/// order.
pub fn bucket_prefix(digest: &Digest) -> Vec<u8> {
    let mut key = Vec::with_capacity(BUCKET_PREFIX.len() + DIGEST_LEN);
    key.extend_from_slice(BUCKET_PREFIX);
    key.extend_from_slice(digest);
    key
}

/// (digest, ec_id) back out of an `h:` key.
pub fn parse_bucket_key(key: &[u8]) -> Result<(Digest, u32)> {
    let rest = key
        .strip_prefix(BUCKET_PREFIX)
        .ok_or_else(|| Error::corrupt(key, "not in the h: key space"))?;
    if rest.len() != DIGEST_LEN + 4 {
        return Err(Error::corrupt(key, "bad bucket key length").into());
    }
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&rest[..DIGEST_LEN]);
    let mut id = [0u8; 4];
    id.copy_from_slice(&rest[DIGEST_LEN..]);
    Ok((digest, u32::from_be_bytes(id)))
}

pub fn config_key(name: &str) -> Vec<u8> {
    let mut key = CONFIG_PREFIX.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn parse_config_key(key: &[u8]) -> Result<String> {
    let rest = key
        .strip_prefix(CONFIG_PREFIX)
        .ok_or_else(|| Error::corrupt(key, "not in the c: key space"))?;
    String::from_utf8(rest.to_vec())
        .map_err(|_| Error::corrupt(key, "non-UTF-8 config name").into())
}

/// Repository-relative path as the string form stored in buckets.
pub fn path_to_string(path: &Path) -> Result<String> {
    Ok(components(path)?.join("/"))
}
