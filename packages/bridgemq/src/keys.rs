//! Key schema: deterministic names for every entity in the store.
//!
//! A single namespace prefix (default `bridgemq`) segments the store. No
//! other module formats a key string; everything goes through [`Keys`] so
//! the layout has exactly one source of truth (the Lua scripts receive the
//! prefix and mirror these shapes).

use sha2::{Digest, Sha256};

/// Default namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "bridgemq";

/// Renders store key names under one namespace prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    ns: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keys {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    /// The raw namespace prefix, as passed to scripts.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    // Job entity sub-keys.

    pub fn job_meta(&self, id: &str) -> String {
        format!("{}:job:{}:meta", self.ns, id)
    }

    pub fn job_config(&self, id: &str) -> String {
        format!("{}:job:{}:config", self.ns, id)
    }

    pub fn job_payload(&self, id: &str) -> String {
        format!("{}:job:{}:payload", self.ns, id)
    }

    pub fn job_result(&self, id: &str) -> String {
        format!("{}:job:{}:result", self.ns, id)
    }

    pub fn job_errors(&self, id: &str) -> String {
        format!("{}:job:{}:errors", self.ns, id)
    }

    pub fn job_depends(&self, id: &str) -> String {
        format!("{}:job:{}:depends", self.ns, id)
    }

    pub fn job_waiters(&self, id: &str) -> String {
        format!("{}:job:{}:waiters", self.ns, id)
    }

    /// Successor templates staged by the complete script (5-minute TTL).
    pub fn job_chain(&self, id: &str) -> String {
        format!("{}:chain:{}", self.ns, id)
    }

    // Queue topology.

    /// Priority queue for `(meshId, type, priority)`; zset scored by the
    /// earliest-eligible timestamp.
    pub fn queue(&self, mesh: &str, job_type: &str, priority: u8) -> String {
        format!("{}:queue:{}:{}:p{}", self.ns, mesh, job_type, priority)
    }

    /// Registry set of populated `type:priority` tuples for a mesh.
    pub fn queues(&self, mesh: &str) -> String {
        format!("{}:queues:{}", self.ns, mesh)
    }

    /// Aggregated pending index; zset scored by priority.
    pub fn pending(&self, mesh: &str) -> String {
        format!("{}:pending:{}", self.ns, mesh)
    }

    /// Per-worker active map: jobId -> claimedAt.
    pub fn active(&self, server: &str) -> String {
        format!("{}:active:{}", self.ns, server)
    }

    /// Set of server ids that currently hold (or recently held) active maps.
    pub fn servers(&self) -> String {
        format!("{}:servers", self.ns)
    }

    /// Global delayed zset scored by scheduledFor.
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.ns)
    }

    pub fn dlq(&self, mesh: &str) -> String {
        format!("{}:dlq:{}", self.ns, mesh)
    }

    /// Reaper index per terminal status; zset scored by completedAt.
    pub fn reap(&self, status: &str) -> String {
        format!("{}:reap:{}", self.ns, status)
    }

    // Registry.

    pub fn mesh(&self, id: &str) -> String {
        format!("{}:mesh:{}", self.ns, id)
    }

    pub fn mesh_members(&self, id: &str) -> String {
        format!("{}:mesh:{}:members", self.ns, id)
    }

    pub fn server(&self, id: &str) -> String {
        format!("{}:server:{}", self.ns, id)
    }

    /// Per-mesh, per-status completion counters.
    pub fn total(&self, mesh: &str, status: &str) -> String {
        format!("{}:total:{}:{}", self.ns, mesh, status)
    }

    // Dedup indexes.

    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idempotency:{}", self.ns, key)
    }

    pub fn fingerprint(&self, hash: &str) -> String {
        format!("{}:fingerprint:{}", self.ns, hash)
    }

    // Rate limiting.

    pub fn ratelimit(&self, key: &str) -> String {
        format!("{}:ratelimit:{}", self.ns, key)
    }

    pub fn ratelimit_queue(&self, key: &str) -> String {
        format!("{}:ratelimitqueue:{}", self.ns, key)
    }

    /// In-flight counter for `rateLimit.maxConcurrent` buckets.
    pub fn ratelimit_concurrent(&self, key: &str) -> String {
        format!("{}:ratelimitconcurrent:{}", self.ns, key)
    }

    // Batching.

    pub fn batch(&self, id: &str) -> String {
        format!("{}:batch:{}", self.ns, id)
    }

    pub fn batch_jobs(&self, id: &str) -> String {
        format!("{}:batch:{}:jobs", self.ns, id)
    }

    pub fn batch_acc(&self, mesh: &str, job_type: &str) -> String {
        format!("{}:batchacc:{}:{}", self.ns, mesh, job_type)
    }

    // Event channels.

    pub fn events_global(&self) -> String {
        format!("{}:events:global", self.ns)
    }

    pub fn events_mesh(&self, mesh: &str) -> String {
        format!("{}:events:mesh:{}", self.ns, mesh)
    }

    pub fn events_job(&self, job: &str) -> String {
        format!("{}:events:job:{}", self.ns, job)
    }

    pub fn events_server(&self, server: &str) -> String {
        format!("{}:events:server:{}", self.ns, server)
    }

    pub fn events_type(&self, job_type: &str) -> String {
        format!("{}:events:type:{}", self.ns, job_type)
    }
}

/// Content hash of `(type, payload)` used for opportunistic deduplication.
///
/// SHA-256 over the type name, a NUL separator, and the raw payload bytes,
/// rendered as lowercase hex.
pub fn fingerprint_hash(job_type: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::default();
        assert_eq!(keys.job_meta("j1"), "bridgemq:job:j1:meta");
        assert_eq!(keys.job_payload("j1"), "bridgemq:job:j1:payload");
        assert_eq!(keys.queue("m", "send_email", 5), "bridgemq:queue:m:send_email:p5");
        assert_eq!(keys.pending("m"), "bridgemq:pending:m");
        assert_eq!(keys.active("w1"), "bridgemq:active:w1");
        assert_eq!(keys.delayed(), "bridgemq:delayed");
        assert_eq!(keys.dlq("m"), "bridgemq:dlq:m");
        assert_eq!(keys.idempotency("k1"), "bridgemq:idempotency:k1");
        assert_eq!(keys.events_mesh("m"), "bridgemq:events:mesh:m");
    }

    #[test]
    fn test_custom_namespace() {
        let keys = Keys::new("staging");
        assert_eq!(keys.namespace(), "staging");
        assert_eq!(keys.server("s1"), "staging:server:s1");
        assert_eq!(keys.events_global(), "staging:events:global");
    }

    #[test]
    fn test_fingerprint_is_stable_and_hex() {
        let a = fingerprint_hash("encode", b"\x01\x02");
        let b = fingerprint_hash("encode", b"\x01\x02");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_separates_type_and_payload() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(fingerprint_hash("ab", b"c"), fingerprint_hash("a", b"bc"));
        assert_ne!(fingerprint_hash("t", b"x"), fingerprint_hash("t", b"y"));
    }
}
