use std::io::Read;

use digest::Digest;

/// Reader adapter feeding everything it reads through a digest.
pub struct StreamHasher<R, H> {
    reader: R,
    hasher: H,
    bytes_read: u64,
}

impl<R, H: Digest> StreamHasher<R, H> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: H::new(),
            bytes_read: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn finalize(self) -> digest::Output<H> {
        self.hasher.finalize()
    }
}

impl<R: Read, H: Digest> Read for StreamHasher<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        self.bytes_read += bytes_read as u64;
        Ok(bytes_read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashes_everything_read() {
        let data = b"Hello, World!";
        let mut hasher = StreamHasher::<_, sha2::Sha256>::new(&data[..]);
        let mut sink = Vec::new();
        hasher.read_to_end(&mut sink).unwrap();
        assert_eq!(hasher.bytes_read(), data.len() as u64);
        assert_eq!(
            hex::encode(hasher.finalize()),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
