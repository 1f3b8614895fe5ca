//! File checksums for print-only output and lineage reports

use pipegraph_storage::File;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Recorded checksum if the graph has one, else SHA-256 of the contents
pub fn checksum(file: &File) -> io::Result<String> {
    match &file.checksum {
        Some(recorded) => Ok(recorded.clone()),
        None => sha256_file(&file.path),
    }
}

/// Hex SHA-256 digest of a file, streamed
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipegraph_storage::FileId;

    #[test]
    fn test_sha256_of_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(
            checksum(&File::new(FileId(1), &path)).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_recorded_checksum_wins() {
        let file = File::new(FileId(1), "/does/not/exist").with_checksum("abc123");
        assert_eq!(checksum(&file).unwrap(), "abc123");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(checksum(&File::new(FileId(1), "/does/not/exist")).is_err());
    }
}
