use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::HailstormError;

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 of a file's contents as lowercase hex.
pub async fn file_sha256(path: impl AsRef<Path>) -> Result<String, HailstormError> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        // Well-known digest of the empty string.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256_hex_differs_for_different_input() {
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }

    #[tokio::test]
    async fn file_sha256_matches_byte_hash() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("content.txt");
        tokio::fs::write(&path, b"hailstorm").await.expect("write should succeed");
        let from_file = file_sha256(&path).await.expect("hash should succeed");
        assert_eq!(from_file, sha256_hex(b"hailstorm"));
    }

    #[tokio::test]
    async fn file_sha256_error_for_missing_file() {
        let result = file_sha256("/nonexistent/path/content.txt").await;
        assert!(result.is_err());
    }
}
