//! Scope hashing for channel names.
//!
//! Channel names embed a hash of the filter scope (typically a user or tenant
//! reference) so the raw scope never appears on the wire.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use vitrine_core::HasherPreference;

/// Strategy for turning a filter scope into a channel-name component.
pub trait ScopeHasher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether the digest resists guessing the scope from the channel name.
    fn is_cryptographic(&self) -> bool;

    fn hash(&self, scope: &str) -> String;
}

/// SHA-256, hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ScopeHasher;

impl ScopeHasher for Sha256ScopeHasher {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn is_cryptographic(&self) -> bool {
        true
    }

    fn hash(&self, scope: &str) -> String {
        hex::encode(Sha256::digest(scope.as_bytes()))
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable and cheap, but scopes can be brute-forced.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aScopeHasher;

impl ScopeHasher for Fnv1aScopeHasher {
    fn name(&self) -> &'static str {
        "fnv1a"
    }

    fn is_cryptographic(&self) -> bool {
        false
    }

    fn hash(&self, scope: &str) -> String {
        let digest = scope.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
        format!("{:016x}", digest)
    }
}

/// Pick the hasher for this process.
pub fn select_hasher(preference: HasherPreference) -> Arc<dyn ScopeHasher> {
    match preference {
        HasherPreference::Crypto | HasherPreference::Auto => Arc::new(Sha256ScopeHasher),
        HasherPreference::Fallback => {
            warn!(
                hasher = "fnv1a",
                "Non-cryptographic scope hasher selected; channel scopes are guessable"
            );
            Arc::new(Fnv1aScopeHasher)
        }
    }
}
