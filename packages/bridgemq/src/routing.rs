//! Routing matcher: does a worker qualify for a job's target?
//!
//! Resolution order:
//! 1. `target.server` set → only that exact server qualifies.
//! 2. Otherwise every non-empty dimension (stack, capabilities, region) must
//!    match. Worker stack/region are single-valued and treated as singleton
//!    sets; `mode=any` needs a non-empty intersection, `mode=all` needs the
//!    required set to be a subset of the worker's.
//! 3. No dimension present → every worker qualifies.
//!
//! Capability patterns may contain wildcards: `*` matches any non-empty
//! capability, `prefix:*` matches any capability sharing the prefix.
//!
//! The same rules run server-side inside `claim_job.lua`; this module is the
//! producer-side mirror used for validation and tests, with the Lua check as
//! the enforcement point.

use serde::{Deserialize, Serialize};

/// How multi-valued dimensions combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// Non-empty intersection per dimension.
    #[default]
    Any,
    /// Required set ⊆ worker set per dimension.
    All,
}

/// Placement constraints carried in `config.target`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetSelector {
    /// Pin to one specific server id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub region: Vec<String>,
    pub mode: TargetMode,
}

/// The routing-relevant identity of a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerProfile {
    pub server_id: String,
    pub stack: String,
    pub region: String,
    pub capabilities: Vec<String>,
}

impl TargetSelector {
    pub fn is_empty(&self) -> bool {
        self.server.as_deref().map_or(true, str::is_empty)
            && self.stack.is_empty()
            && self.capabilities.is_empty()
            && self.region.is_empty()
    }

    /// Does `worker` qualify for this target?
    pub fn matches(&self, worker: &WorkerProfile) -> bool {
        if let Some(server) = self.server.as_deref() {
            if !server.is_empty() {
                return worker.server_id == server;
            }
        }

        if !self.stack.is_empty() && !dimension_matches(&self.stack, &[worker.stack.as_str()], self.mode) {
            return false;
        }
        if !self.region.is_empty()
            && !dimension_matches(&self.region, &[worker.region.as_str()], self.mode)
        {
            return false;
        }
        if !self.capabilities.is_empty() {
            let matched = match self.mode {
                TargetMode::Any => self
                    .capabilities
                    .iter()
                    .any(|pattern| worker.capabilities.iter().any(|c| capability_matches(c, pattern))),
                TargetMode::All => self
                    .capabilities
                    .iter()
                    .all(|pattern| worker.capabilities.iter().any(|c| capability_matches(c, pattern))),
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

fn dimension_matches(required: &[String], worker: &[&str], mode: TargetMode) -> bool {
    match mode {
        TargetMode::Any => required.iter().any(|r| worker.contains(&r.as_str())),
        TargetMode::All => required.iter().all(|r| worker.contains(&r.as_str())),
    }
}

/// Match one worker capability against one required pattern.
///
/// `*` matches any non-empty capability; `gpu:*` matches `gpu:cuda` and
/// `gpu:` alike; anything else compares exactly.
pub fn capability_matches(capability: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return !capability.is_empty();
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return capability.starts_with(prefix);
    }
    capability == pattern
}
