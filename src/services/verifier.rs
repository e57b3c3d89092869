use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{EngineError, Result};

/// Check the assembled file against declared size and/or SHA-256. A missing
/// declared value skips that check; size is compared first because it is
/// free. Runs blocking on the worker pool.
pub fn verify_file(
    path: &Path,
    expected_size: Option<i64>,
    expected_sha256: Option<&str>,
) -> Result<()> {
    let metadata = std::fs::metadata(path)?;

    if let Some(expected) = expected_size {
        let actual = metadata.len() as i64;
        if actual != expected {
            return Err(EngineError::Integrity(format!(
                "size mismatch for {}: expected {expected}, got {actual}",
                path.display()
            )));
        }
    }

    if let Some(expected) = expected_sha256 {
        let expected = expected.trim().to_ascii_lowercase();
        let actual = sha256_file(path)?;
        if actual != expected {
            return Err(EngineError::Integrity(format!(
                "hash mismatch for {}: expected {expected}, got {actual}",
                path.display()
            )));
        }
    }

    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn matching_size_and_hash_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.bin");
        std::fs::write(&path, b"hello").unwrap();

        verify_file(&path, Some(5), Some(HELLO_SHA256)).unwrap();
        // Declared hash comparison ignores case.
        verify_file(&path, None, Some(&HELLO_SHA256.to_uppercase())).unwrap();
    }

    #[test]
    fn size_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.bin");
        std::fs::write(&path, b"hello").unwrap();

        let err = verify_file(&path, Some(6), None).unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[test]
    fn hash_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.bin");
        std::fs::write(&path, b"hello!").unwrap();

        let err = verify_file(&path, None, Some(HELLO_SHA256)).unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[test]
    fn absent_declared_values_skip_their_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rom.bin");
        std::fs::write(&path, b"anything").unwrap();
        verify_file(&path, None, None).unwrap();
    }

    #[test]
    fn missing_file_is_a_disk_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.bin");
        let err = verify_file(&path, Some(1), None).unwrap_err();
        assert!(matches!(err, EngineError::Disk(_)));
    }
}
