//! Content hashing ("weed") used by `ContentBased` cluster-cache mode.

use sha2::{Digest, Sha256};

pub fn weed(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}
