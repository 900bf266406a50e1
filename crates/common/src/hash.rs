use std::io::{self, Write};

use blake2::{digest::typenum::U32, Blake2b, Digest};

pub fn blake2(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// [`Write`] adapter that hashes every byte passed through it.
///
/// Used to compute an archive hash while the archive is being written,
/// so the archive never has to be read back into memory.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Blake2b<U32>,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Blake2b::<U32>::new(),
            written: 0,
        }
    }

    /// Total amount of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consume the writer, returning the inner writer and the final digest.
    pub fn finalize(self) -> (W, [u8; 32]) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.inner.write(buf)?;
        self.hasher.update(&buf[..len]);
        self.written += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{blake2, HashingWriter};

    #[test]
    fn hashing_writer_matches_one_shot_hash() {
        let mut writer = HashingWriter::new(Vec::new());

        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();

        assert_eq!(writer.written(), 11);

        let (buf, digest) = writer.finalize();

        assert_eq!(buf, b"hello world");
        assert_eq!(digest, blake2(b"hello world"));
    }
}
