use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crc::{Crc, Digest, CRC_64_ECMA_182};

/// CRC-64 used for whole-file fingerprints of tables and backup files.
pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Streaming CRC-64 digest.
pub struct Hasher {
    digest: Digest<'static, u64>,
    len: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({} bytes)", self.len)
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    pub fn finalize(self) -> u64 {
        self.digest.finalize()
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reset(&mut self) {
        self.digest = CRC64.digest();
        self.len = 0;
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer adapter that fingerprints everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.hasher.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Returns the inner writer and the checksum of everything written.
    pub fn finish(self) -> (W, u64) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.write(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copies at most `limit` bytes from `reader` into `writer`, returning the
/// number of bytes copied and their CRC-64.
pub fn copy_hashed<R: Read, W: Write>(
    reader: R,
    writer: W,
    limit: Option<u64>,
) -> io::Result<(u64, u64)> {
    let mut out = HashingWriter::new(writer);
    let copied = match limit {
        Some(limit) => io::copy(&mut reader.take(limit), &mut out)?,
        None => {
            let mut reader = reader;
            io::copy(&mut reader, &mut out)?
        }
    };
    out.flush()?;
    let (_, crc) = out.finish();
    Ok((copied, crc))
}

/// Size and CRC-64 of a file on disk.
pub fn checksum_file(path: &Path) -> io::Result<(u64, u64)> {
    let file = File::open(path)?;
    copy_hashed(file, io::sink(), None)
}
