/*
Byte-level equality of two files, streamed in fixed-size chunks. This is
the proof step behind every equivalent class: hash equality alone never
merges files.
*/

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// Read until `buf` is full or EOF, returning the number of bytes read.
/// Plain `read` may return short counts at different boundaries for the
/// two sides, so both are filled before comparing.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Compare two readers to exhaustion.
pub fn readers_equal<A: Read, B: Read>(mut a: A, mut b: B) -> std::io::Result<bool> {
    let mut buf_a = vec![0u8; CHUNK_SIZE];
    let mut buf_b = vec![0u8; CHUNK_SIZE];

    loop {
        let na = read_full(&mut a, &mut buf_a)?;
        let nb = read_full(&mut b, &mut buf_b)?;

        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// Compare two files byte for byte.
pub fn files_equal(a: &Path, b: &Path) -> Result<bool> {
    let fa = File::open(a).with_context(|| format!("Failed to open {}", a.display()))?;
    let fb = File::open(b).with_context(|| format!("Failed to open {}", b.display()))?;

    readers_equal(fa, fb)
        .with_context(|| format!("Failed to compare {} and {}", a.display(), b.display()))
}
