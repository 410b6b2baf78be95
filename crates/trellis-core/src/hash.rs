use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::artifact::ArtifactSpec;

/// Hashes are truncated SHA-256, long enough to key snapshots and cache
/// rows without collisions in practice, short enough for filenames.
const HASH_HEX_LEN: usize = 16;

fn truncated_hex(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(HASH_HEX_LEN);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
        if hex.len() >= HASH_HEX_LEN {
            break;
        }
    }
    hex.truncate(HASH_HEX_LEN);
    hex
}

/// Content hash of arbitrary bytes.
pub fn hash_content(data: &[u8]) -> String {
    truncated_hex(&Sha256::digest(data))
}

/// Stable key for a goal string; whitespace at the edges does not count.
pub fn hash_goal(goal: &str) -> String {
    hash_content(goal.trim().as_bytes())
}

/// Input hash for one artifact: covers its own spec plus the content hash
/// of every dependency, so a change anywhere upstream changes the input
/// hash of everything downstream.
///
/// `dep_hashes` maps dependency id to the content hash of its produced
/// output; dependencies without an entry contribute only their id.
pub fn artifact_input_hash(spec: &ArtifactSpec, dep_hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.id.as_bytes());
    hasher.update([0]);
    hasher.update(spec.description.as_bytes());
    hasher.update([0]);
    hasher.update(spec.contract.as_bytes());
    // BTreeSet iterates sorted, so the hash is order-independent.
    for req in &spec.requires {
        hasher.update([0]);
        hasher.update(req.as_bytes());
        if let Some(dep_hash) = dep_hashes.get(req) {
            hasher.update(b"=");
            hasher.update(dep_hash.as_bytes());
        }
    }
    truncated_hex(&hasher.finalize())
}
