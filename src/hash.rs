/*
Streaming content hashing. The algorithm is chosen once per repository at
rebuild time and recorded under `c:hash-algorithm`; both supported
algorithms produce 32-byte digests so key layouts are identical.

Hashing never stats the file. Callers sample mtime before opening so that a
concurrent modification during hashing yields a stale signature the next
refresh will recompute.
*/

use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => anyhow::bail!("unknown hash algorithm: {other}"),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Blake3(h) => {
                h.update(bytes);
            }
        }
    }

    fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(h) => h.finalize().into(),
            Hasher::Blake3(h) => *h.finalize().as_bytes(),
        }
    }
}

/// Hash a reader to completion, returning the digest and the number of
/// bytes consumed.
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> Result<(Digest, u64)> {
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize(), total))
}

/// Hash a file's full content in streaming chunks.
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<(Digest, u64)> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    hash_reader(algorithm, file)
        .with_context(|| format!("Failed to hash {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const SHA256_HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_algorithm_name_round_trip() -> Result<()> {
        for algo in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            assert_eq!(algo.name().parse::<HashAlgorithm>()?, algo);
        }
        assert!("md5".parse::<HashAlgorithm>().is_err());
        Ok(())
    }

    #[test]
    fn test_empty_input_digest() -> Result<()> {
        let (digest, len) = hash_reader(HashAlgorithm::Sha256, &b""[..])?;
        assert_eq!(hex::encode(digest), SHA256_EMPTY);
        assert_eq!(len, 0);
        Ok(())
    }

    #[test]
    fn test_known_digest() -> Result<()> {
        let (digest, len) = hash_reader(HashAlgorithm::Sha256, &b"hello"[..])?;
        assert_eq!(hex::encode(digest), SHA256_HELLO);
        assert_eq!(len, 5);
        Ok(())
    }

    #[test]
    fn test_hash_file_counts_bytes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("data");
        let content = vec![0x5a; CHUNK_SIZE + 17];
        fs::write(&path, &content)?;

        let (from_file, len) = hash_file(HashAlgorithm::Blake3, &path)?;
        let (from_mem, _) = hash_reader(HashAlgorithm::Blake3, &content[..])?;

        assert_eq!(from_file, from_mem);
        assert_eq!(len, content.len() as u64);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(hash_file(HashAlgorithm::Sha256, &missing).is_err());
    }
}
