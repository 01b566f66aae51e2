/*
Index value records and their MessagePack codecs.

A signature serializes as the array [digest, mtime_ns, ec_id] with nil
standing in for an unassigned ec_id; a bucket serializes as the bare array
of member path strings. Both encodings are byte-stable: re-encoding a
decoded value reproduces the input exactly.
*/

use crate::error::Error;
use crate::hash::{Digest, DIGEST_LEN};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    #[serde(with = "serde_bytes")]
    pub digest: Vec<u8>,
    pub mtime_ns: i64,
    pub ec_id: Option<u32>,
}

impl FileSignature {
    pub fn new(digest: Digest, mtime_ns: i64, ec_id: Option<u32>) -> Self {
        Self {
            digest: digest.to_vec(),
            mtime_ns,
            ec_id,
        }
    }

    /// The fixed-width digest, validating stored length.
    pub fn digest(&self, key: &[u8]) -> Result<Digest> {
        if self.digest.len() != DIGEST_LEN {
            return Err(Error::corrupt(key, "signature digest has wrong length").into());
        }
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.digest);
        Ok(out)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::corrupt(key, format!("undecodable signature: {e}")).into())
    }
}

/// One equivalent class: the ordered member paths, kept sorted and unique
/// so the stored form is independent of arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bucket {
    pub paths: Vec<String>,
}

impl Bucket {
    pub fn single(path: String) -> Self {
        Self { paths: vec![path] }
    }

    /// Sorted insert; returns false if the path was already a member.
    pub fn insert(&mut self, path: &str) -> bool {
        match self.paths.binary_search_by(|p| p.as_str().cmp(path)) {
            Ok(_) => false,
            Err(pos) => {
                self.paths.insert(pos, path.to_string());
                true
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> bool {
        match self.paths.binary_search_by(|p| p.as_str().cmp(path)) {
            Ok(pos) => {
                self.paths.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.binary_search_by(|p| p.as_str().cmp(path)).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| Error::corrupt(key, format!("undecodable bucket: {e}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip_is_byte_stable() -> Result<()> {
        for ec_id in [None, Some(0), Some(7)] {
            let sig = FileSignature::new([0x11; DIGEST_LEN], -42, ec_id);
            let bytes = sig.to_bytes()?;
            let decoded = FileSignature::from_bytes(b"m:x\0", &bytes)?;
            assert_eq!(decoded, sig);
            assert_eq!(decoded.to_bytes()?, bytes);
        }
        Ok(())
    }

    #[test]
    fn test_absent_ec_id_encodes_as_nil() -> Result<()> {
        let unset = FileSignature::new([0; DIGEST_LEN], 0, None).to_bytes()?;
        let set = FileSignature::new([0; DIGEST_LEN], 0, Some(0)).to_bytes()?;

        // msgpack nil marker
        assert_eq!(*unset.last().unwrap(), 0xc0);
        assert_ne!(unset, set);
        Ok(())
    }

    #[test]
    fn test_signature_digest_length_checked() -> Result<()> {
        let mut sig = FileSignature::new([0; DIGEST_LEN], 0, None);
        sig.digest.pop();
        assert!(sig.digest(b"m:x\0").is_err());
        Ok(())
    }

    #[test]
    fn test_garbage_is_corruption() {
        let err = FileSignature::from_bytes(b"m:x\0", b"\xc1junk").unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
    }

    #[test]
    fn test_bucket_round_trip_is_byte_stable() -> Result<()> {
        let mut bucket = Bucket::default();
        bucket.insert("b/c");
        bucket.insert("a");
        let bytes = bucket.to_bytes()?;
        let decoded = Bucket::from_bytes(b"h:k", &bytes)?;
        assert_eq!(decoded, bucket);
        assert_eq!(decoded.to_bytes()?, bytes);
        Ok(())
    }

    #[test]
    fn test_bucket_insert_is_sorted_and_unique() {
        let mut bucket = Bucket::default();
        assert!(bucket.insert("b/d"));
        assert!(bucket.insert("a"));
        assert!(bucket.insert("b/c"));
        assert!(!bucket.insert("a"));

        assert_eq!(bucket.paths, vec!["a", "b/c", "b/d"]);
        assert!(bucket.contains("b/c"));

        assert!(bucket.remove("b/c"));
        assert!(!bucket.remove("b/c"));
        assert_eq!(bucket.paths, vec!["a", "b/d"]);
    }
}
