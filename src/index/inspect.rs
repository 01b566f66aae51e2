/*
Line-oriented dump of the whole index, one line per entry in store key
order. The format is stable and covered by test:

  config <name> <value>
  bucket <digest-hex> <ec_id> <path>[ <path>...]
  file <path> <digest-hex> <mtime_ns> <ec_id|->

Any entry that fails to decode aborts the dump with a diagnostic naming
the offending key; `rebuild` is the recovery.
*/

use anyhow::Result;
use std::io::Write;

use crate::error::Error;
use crate::index::keys::{
    parse_bucket_key, parse_config_key, parse_sig_key, BUCKET_PREFIX, CONFIG_PREFIX, SIG_PREFIX,
};
use crate::index::record::{Bucket, FileSignature};
use crate::index::store::Store;

pub fn inspect<W: Write>(store: &Store, out: &mut W) -> Result<()> {
    for item in store.iter_prefix(CONFIG_PREFIX) {
        let (key, value) = item?;
        let name = parse_config_key(&key)?;
        let value = std::str::from_utf8(&value)
            .map_err(|_| Error::corrupt(&key, "non-UTF-8 config value"))?;
        writeln!(out, "config {name} {value}")?;
    }

    for item in store.iter_prefix(BUCKET_PREFIX) {
        let (key, value) = item?;
        let (digest, ec_id) = parse_bucket_key(&key)?;
        let bucket = Bucket::from_bytes(&key, &value)?;
        if bucket.is_empty() {
            return Err(Error::corrupt(&key, "empty bucket").into());
        }
        write!(out, "bucket {} {}", hex::encode(digest), ec_id)?;
        for path in &bucket.paths {
            write!(out, " {path}")?;
        }
        writeln!(out)?;
    }

    for item in store.iter_prefix(SIG_PREFIX) {
        let (key, value) = item?;
        let rel = parse_sig_key(&key)?;
        let sig = FileSignature::from_bytes(&key, &value)?;
        let digest = sig.digest(&key)?;
        write!(
            out,
            "file {} {} {} ",
            rel.display(),
            hex::encode(digest),
            sig.mtime_ns
        )?;
        match sig.ec_id {
            Some(id) => writeln!(out, "{id}")?,
            None => writeln!(out, "-")?,
        }
    }

    Ok(())
}
