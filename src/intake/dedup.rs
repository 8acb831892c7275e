//! Content-hash deduplication.

use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use crate::db::UploadRepository;
use crate::models::UploadRecord;

/// SHA-256 of raw upload bytes, hex-encoded.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Look up an existing upload with the same content for this tenant.
/// A repository failure here is non-fatal: the unique `(tenant, sha256)`
/// index still guarantees at most one record at insert time.
pub fn check_duplicate(
    uploads: &dyn UploadRepository,
    yacht_id: Uuid,
    sha256: &str,
) -> Option<UploadRecord> {
    match uploads.find_by_tenant_sha(yacht_id, sha256) {
        Ok(Some(existing)) => {
            info!(
                yacht_id = %yacht_id,
                existing_id = %existing.id,
                sha256 = &sha256[..16.min(sha256.len())],
                "♻️ Duplicate upload detected"
            );
            Some(existing)
        }
        Ok(None) => None,
        Err(e) => {
            error!(yacht_id = %yacht_id, error = %e, "Duplicate check failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
