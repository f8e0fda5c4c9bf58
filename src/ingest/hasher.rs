use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use memmap2::MmapOptions;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{ExtractError, Result};

pub const CHUNK_SIZE: usize = 4096;
const MMAP_THRESHOLD: u64 = 500 * 1024 * 1024; // 500 MB

/// Lowercase hex digests of a file's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigests {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

#[derive(Default)]
struct MultiHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
}

impl MultiHasher {
    fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
    }

    fn finalize(self) -> ContentDigests {
        ContentDigests {
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
        }
    }
}

/// Digest a stream in `CHUNK_SIZE` pieces. Nothing is returned unless the
/// whole stream was read.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<ContentDigests> {
    let mut hasher = MultiHasher::default();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let count = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..count]);
    }
    Ok(hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<ContentDigests> {
    let file = File::open(path).map_err(|e| ExtractError::io(path, e))?;
    let len = file.metadata().map_err(|e| ExtractError::io(path, e))?.len();

    if len > MMAP_THRESHOLD {
        // The file is assumed not to be truncated while mapped.
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| ExtractError::io(path, e))?;
        let mut hasher = MultiHasher::default();
        for chunk in mmap.chunks(CHUNK_SIZE) {
            hasher.update(chunk);
        }
        Ok(hasher.finalize())
    } else {
        digest_reader(BufReader::new(file)).map_err(|e| ExtractError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    /// Hands out at most `step` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
        }
    }

    #[test]
    fn test_known_digests_of_empty_input() {
        let digests = digest_reader(&b""[..]).unwrap();
        assert_eq!(digests.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(digests.sha1, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            digests.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_known_digests_of_abc() {
        let digests = digest_reader(&b"abc"[..]).unwrap();
        assert_eq!(digests.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(digests.sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            digests.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digests.md5.len(), 32);
        assert_eq!(digests.sha1.len(), 40);
        assert_eq!(digests.sha256.len(), 64);
    }

    #[test]
    fn test_read_failure_returns_no_digests() {
        assert!(digest_reader(Broken).is_err());
    }

    #[test]
    fn test_digest_file_matches_reader() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).unwrap();
        file.flush().unwrap();

        let from_file = digest_file(file.path()).unwrap();
        let from_reader = digest_reader(&payload[..]).unwrap();
        assert_eq!(from_file, from_reader);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = digest_file(Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, ExtractError::Io { .. }));
    }

    proptest! {
        #[test]
        fn digests_do_not_depend_on_read_sizes(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            step in 1usize..9000,
        ) {
            let whole = digest_reader(&data[..]).unwrap();
            let trickled = digest_reader(Trickle { data: &data, step }).unwrap();
            prop_assert_eq!(whole, trickled);
        }
    }
}
