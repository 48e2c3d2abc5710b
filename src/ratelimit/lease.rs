//! Reserve-now, settle-later capacity leases.
//!
//! A lease token carries everything needed to settle it: the bucket the
//! reservation landed in, the reserved cost and the deadline. Tokens are
//! protobuf-encoded claims plus an HMAC-SHA256 tag keyed per workspace,
//! wrapped in base64url, so no lease table is needed and a token minted for
//! one workspace cannot be committed from another.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use prost::Message;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::identifier::{BucketKey, Identifier};
use crate::error::ValidationError;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation for per-workspace signing keys.
const WORKSPACE_KEY_CONTEXT: &[u8] = b"keygate/lease/v1/";

/// Derived workspace keys kept around; past this, keys are derived per call.
const MAX_CACHED_WORKSPACES: usize = 4_096;

/// What a lease token asserts.
#[derive(Clone, PartialEq, Message)]
pub struct LeaseClaims {
    #[prost(string, tag = "1")]
    pub lease_id: String,
    #[prost(string, tag = "2")]
    pub workspace_id: String,
    #[prost(string, tag = "3")]
    pub config_id: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(uint32, tag = "5")]
    pub limit: u32,
    #[prost(uint64, tag = "6")]
    pub duration_ms: u64,
    /// Window the reservation was charged to
    #[prost(uint64, tag = "7")]
    pub window_start: u64,
    #[prost(uint64, tag = "8")]
    pub reserved_cost: u64,
    #[prost(message, optional, tag = "9")]
    pub issued_at: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "10")]
    pub timeout: Option<prost_types::Duration>,
    #[prost(bool, tag = "11")]
    pub auto_apply: bool,
}

impl LeaseClaims {
    /// The bucket the reservation was charged to.
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::new(
            Identifier::new(self.config_id.clone(), self.name.clone()),
            self.duration_ms,
            self.window_start,
        )
    }

    /// Unix ms after which the lease can no longer be committed.
    pub fn expires_at_ms(&self) -> u64 {
        let issued = self.issued_at.as_ref().map(timestamp_to_ms).unwrap_or(0);
        let timeout = self.timeout.as_ref().map(duration_to_ms).unwrap_or(0);
        issued.saturating_add(timeout)
    }
}

#[derive(Clone, PartialEq, Message)]
struct SealedLease {
    #[prost(bytes = "vec", tag = "1")]
    claims: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    tag: Vec<u8>,
}

/// A lease as handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: String,
    /// Opaque token to pass to commit
    pub token: String,
    pub reserved_cost: u64,
    /// Unix ms deadline for commit
    pub expires_at: u64,
}

/// Seals and opens lease tokens and enforces single use.
pub struct LeaseManager {
    /// Keyed with the node secret; workspace keys are derived from it
    root: HmacSha256,
    workspace_macs: DashMap<String, HmacSha256>,
    max_timeout_ms: u64,
    /// Committed lease IDs, kept until the lease would have expired anyway
    committed: DashMap<String, u64>,
}

impl LeaseManager {
    pub fn new(secret: impl AsRef<[u8]>, max_timeout_ms: u64) -> Self {
        Self {
            root: hmac_from_key(secret.as_ref()),
            workspace_macs: DashMap::new(),
            max_timeout_ms,
            committed: DashMap::new(),
        }
    }

    pub fn max_timeout_ms(&self) -> u64 {
        self.max_timeout_ms
    }

    /// Check a requested lease timeout.
    pub fn validate_timeout(&self, timeout_ms: i64) -> Result<u64, ValidationError> {
        if timeout_ms <= 0 || timeout_ms as u64 > self.max_timeout_ms {
            return Err(ValidationError::InvalidLeaseTimeout {
                timeout: timeout_ms,
                max: self.max_timeout_ms,
            });
        }
        Ok(timeout_ms as u64)
    }

    /// Encode and sign claims into a token bound to their workspace.
    pub fn seal(&self, claims: &LeaseClaims) -> String {
        let body = claims.encode_to_vec();
        let mut mac = self.mac_for(&claims.workspace_id);
        mac.update(&body);

        let sealed = SealedLease {
            claims: body,
            tag: mac.finalize().into_bytes().to_vec(),
        };
        URL_SAFE_NO_PAD.encode(sealed.encode_to_vec())
    }

    /// Decode a token and verify it was issued for `workspace_id`.
    pub fn open(&self, workspace_id: &str, token: &str) -> Result<LeaseClaims, ValidationError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| ValidationError::MalformedLease(e.to_string()))?;
        let sealed = SealedLease::decode(raw.as_slice())
            .map_err(|e| ValidationError::MalformedLease(e.to_string()))?;

        let mut mac = self.mac_for(workspace_id);
        mac.update(&sealed.claims);
        mac.verify_slice(&sealed.tag)
            .map_err(|_| ValidationError::LeaseSignature)?;

        let claims = LeaseClaims::decode(sealed.claims.as_slice())
            .map_err(|e| ValidationError::MalformedLease(e.to_string()))?;
        if claims.workspace_id != workspace_id {
            return Err(ValidationError::LeaseSignature);
        }
        Ok(claims)
    }

    /// Mark a lease as committed, rejecting expired or reused leases.
    pub fn claim(&self, claims: &LeaseClaims, now_ms: u64) -> Result<(), ValidationError> {
        let expires_at = claims.expires_at_ms();
        if now_ms > expires_at {
            return Err(ValidationError::LeaseExpired(claims.lease_id.clone()));
        }

        match self.committed.entry(claims.lease_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ValidationError::LeaseAlreadyCommitted(claims.lease_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(expires_at);
                Ok(())
            }
        }
    }

    /// Forget committed leases that have expired; they fail the deadline
    /// check on their own from now on.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.committed.len();
        self.committed.retain(|_, expires_at| *expires_at >= now_ms);
        let removed = before.saturating_sub(self.committed.len());
        if removed > 0 {
            debug!(removed, "Forgot expired committed leases");
        }
        removed
    }

    fn mac_for(&self, workspace_id: &str) -> HmacSha256 {
        if let Some(mac) = self.workspace_macs.get(workspace_id) {
            return mac.value().clone();
        }

        let mut derive = self.root.clone();
        derive.update(WORKSPACE_KEY_CONTEXT);
        derive.update(workspace_id.as_bytes());
        let mac = hmac_from_key(&derive.finalize().into_bytes());

        if self.workspace_macs.len() < MAX_CACHED_WORKSPACES {
            self.workspace_macs
                .insert(workspace_id.to_string(), mac.clone());
        }
        mac
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("max_timeout_ms", &self.max_timeout_ms)
            .field("cached_workspaces", &self.workspace_macs.len())
            .field("committed", &self.committed.len())
            .finish()
    }
}

/// HMAC-SHA256 for a key of any length, normalized as RFC 2104 does:
/// keys longer than a block are hashed, shorter ones are zero-padded.
fn hmac_from_key(key: &[u8]) -> HmacSha256 {
    let mut block = Key::<HmacSha256>::default();
    if key.len() > block.len() {
        let digest = <Sha256 as sha2::Digest>::digest(key);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }
    <HmacSha256 as KeyInit>::new(&block)
}

pub fn timestamp_from_ms(ms: u64) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: (ms / 1_000) as i64,
        nanos: ((ms % 1_000) * 1_000_000) as i32,
    }
}

pub fn duration_from_ms(ms: u64) -> prost_types::Duration {
    prost_types::Duration {
        seconds: (ms / 1_000) as i64,
        nanos: ((ms % 1_000) * 1_000_000) as i32,
    }
}

fn timestamp_to_ms(ts: &prost_types::Timestamp) -> u64 {
    (ts.seconds.max(0) as u64) * 1_000 + (ts.nanos.max(0) as u64) / 1_000_000
}

fn duration_to_ms(d: &prost_types::Duration) -> u64 {
    (d.seconds.max(0) as u64) * 1_000 + (d.nanos.max(0) as u64) / 1_000_000
}
