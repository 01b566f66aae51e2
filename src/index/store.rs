/*
Thin typed wrapper over the sled tree backing an index. Point reads and
writes go straight through; every multi-key mutation that carries the
index invariants travels through an atomic `WriteBatch`.
*/

use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug)]
pub struct Store {
    db: sled::Db,
}

/// Buffered mutations applied atomically by `Store::apply`.
#[derive(Default)]
pub struct WriteBatch {
    inner: sled::Batch,
    len: usize,
}

impl WriteBatch {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.inner.insert(key, value);
        self.len += 1;
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.inner.remove(key);
        self.len += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::Config::default()
            .path(dir)
            .open()
            .with_context(|| format!("Failed to open index store at {}", dir.display()))?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::default()
            .temporary(true)
            .open()
            .context("Failed to open temporary store")?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key)
            .with_context(|| format!("Failed to read key {}", String::from_utf8_lossy(key)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db.contains_key(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .with_context(|| format!("Failed to write key {}", String::from_utf8_lossy(key)))?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .remove(key)
            .with_context(|| format!("Failed to delete key {}", String::from_utf8_lossy(key)))?;
        Ok(())
    }

    /// Lazy iteration over a key range in lexicographic order.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a {
        self.db.scan_prefix(prefix).map(|item| {
            let (key, value) = item.context("Failed to iterate index store")?;
            Ok((key.to_vec(), value.to_vec()))
        })
    }

    /// Apply a batch atomically.
    pub fn apply(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .apply_batch(batch.inner)
            .context("Failed to apply batch to index store")?;
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self.db.iter().next() {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e).context("Failed to iterate index store"),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("Failed to flush index store")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_operations() -> Result<()> {
        let store = Store::temporary()?;

        assert_eq!(store.get(b"k")?, None);
        store.put(b"k", b"v")?;
        assert_eq!(store.get(b"k")?, Some(b"v".to_vec()));
        assert!(store.contains(b"k")?);

        store.delete(b"k")?;
        assert_eq!(store.get(b"k")?, None);
        assert!(store.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_prefix_iteration_is_ordered_and_scoped() -> Result<()> {
        let store = Store::temporary()?;
        store.put(b"a:2", b"x")?;
        store.put(b"a:1", b"y")?;
        store.put(b"a:10", b"z")?;
        store.put(b"b:1", b"w")?;

        let keys: Vec<Vec<u8>> = store
            .iter_prefix(b"a:")
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_>>()?;

        assert_eq!(keys, vec![b"a:1".to_vec(), b"a:10".to_vec(), b"a:2".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_batch_applies_all_operations() -> Result<()> {
        let store = Store::temporary()?;
        store.put(b"old", b"1")?;

        let mut batch = WriteBatch::default();
        assert!(batch.is_empty());
        batch.put(b"new-a", b"2");
        batch.put(b"new-b", b"3");
        batch.delete(b"old");
        assert_eq!(batch.len(), 3);

        store.apply(batch)?;

        assert_eq!(store.get(b"old")?, None);
        assert_eq!(store.get(b"new-a")?, Some(b"2".to_vec()));
        assert_eq!(store.get(b"new-b")?, Some(b"3".to_vec()));
        Ok(())
    }

    #[test]
    fn test_open_persists_across_reopen() -> Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let dir = temp_dir.path().join("store");

        {
            let store = Store::open(&dir)?;
            store.put(b"k", b"v")?;
            store.flush()?;
        }

        let store = Store::open(&dir)?;
        assert_eq!(store.get(b"k")?, Some(b"v".to_vec()));
        Ok(())
    }
}
