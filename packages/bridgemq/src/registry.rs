//! Server and mesh registry.
//!
//! A server is a process registered in a mesh; its store entry carries a TTL
//! refreshed by heartbeat, so absence of the key means the server is dead;
//! there is no separate liveness protocol. Meshes are auto-created on first
//! registration.
//!
//! Registry keys sit outside the queue invariants, so these are plain
//! commands rather than scripts; the stall detector and claim path never
//! read them for correctness, only for liveness hints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::keys::Keys;
use crate::store::Store;

/// Server liveness/registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
    Draining,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Draining => "draining",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(ServerStatus::Online),
            "offline" => Ok(ServerStatus::Offline),
            "draining" => Ok(ServerStatus::Draining),
            other => Err(Error::StorageRead(format!("unknown server status {other:?}"))),
        }
    }
}

/// A registered server.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_id: String,
    pub stack: String,
    pub capabilities: Vec<String>,
    pub mesh_ids: Vec<String>,
    pub region: String,
    pub resources: serde_json::Value,
    pub metadata: serde_json::Value,
    pub status: ServerStatus,
    pub last_heartbeat: i64,
    pub current_load: u32,
    pub total_processed: u64,
    pub total_failed: u64,
}

impl ServerInfo {
    pub fn new(server_id: impl Into<String>, mesh_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            stack: String::new(),
            capabilities: Vec::new(),
            mesh_ids: vec![mesh_id.into()],
            region: String::new(),
            resources: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            status: ServerStatus::Online,
            last_heartbeat: 0,
            current_load: 0,
            total_processed: 0,
            total_failed: 0,
        }
    }
}

/// A mesh (tenant) record.
#[derive(Debug, Clone)]
pub struct MeshInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub config: serde_json::Value,
}

/// Default server TTL; a heartbeat must land inside this window.
pub const DEFAULT_SERVER_TTL_SECS: u64 = 15;

/// Registry operations over the store.
#[derive(Clone)]
pub struct Registry {
    store: Store,
    keys: Keys,
    server_ttl_secs: u64,
}

impl Registry {
    pub fn new(store: Store, keys: Keys) -> Self {
        Self {
            store,
            keys,
            server_ttl_secs: DEFAULT_SERVER_TTL_SECS,
        }
    }

    pub fn with_server_ttl(mut self, ttl_secs: u64) -> Self {
        self.server_ttl_secs = ttl_secs;
        self
    }

    /// Register a server, auto-creating every mesh it belongs to.
    pub async fn register_server(&self, info: &ServerInfo, clock: &dyn Clock) -> Result<()> {
        let now = clock.now_ms();
        let mut conn = self.store.conn().await?;

        for mesh_id in &info.mesh_ids {
            let mesh_key = self.keys.mesh(mesh_id);
            let created: bool = redis::cmd("HSETNX")
                .arg(&mesh_key)
                .arg("id")
                .arg(mesh_id)
                .query_async(&mut conn)
                .await?;
            if created {
                let _: i64 = redis::cmd("HSET")
                    .arg(&mesh_key)
                    .arg("name")
                    .arg(mesh_id)
                    .arg("description")
                    .arg("")
                    .arg("createdAt")
                    .arg(now)
                    .arg("config")
                    .arg("{}")
                    .query_async(&mut conn)
                    .await?;
                info!(mesh_id, "mesh auto-created");
            }
            let _: i64 = redis::cmd("SADD")
                .arg(self.keys.mesh_members(mesh_id))
                .arg(&info.server_id)
                .query_async(&mut conn)
                .await?;
        }

        let server_key = self.keys.server(&info.server_id);
        let _: i64 = redis::cmd("HSET")
            .arg(&server_key)
            .arg("id")
            .arg(&info.server_id)
            .arg("stack")
            .arg(&info.stack)
            .arg("capabilities")
            .arg(info.capabilities.join(","))
            .arg("meshIds")
            .arg(info.mesh_ids.join(","))
            .arg("region")
            .arg(&info.region)
            .arg("resources")
            .arg(info.resources.to_string())
            .arg("metadata")
            .arg(info.metadata.to_string())
            .arg("status")
            .arg(info.status.as_str())
            .arg("lastHeartbeat")
            .arg(now)
            .arg("currentLoad")
            .arg(info.current_load)
            .arg("totalProcessed")
            .arg(info.total_processed)
            .arg("totalFailed")
            .arg(info.total_failed)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("EXPIRE")
            .arg(&server_key)
            .arg(self.server_ttl_secs)
            .query_async(&mut conn)
            .await?;
        info!(server_id = %info.server_id, "server registered");
        Ok(())
    }

    /// Refresh liveness and load; re-arms the TTL.
    pub async fn heartbeat(
        &self,
        server_id: &str,
        current_load: u32,
        clock: &dyn Clock,
    ) -> Result<()> {
        let server_key = self.keys.server(server_id);
        let mut conn = self.store.conn().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(&server_key)
            .arg("lastHeartbeat")
            .arg(clock.now_ms())
            .arg("currentLoad")
            .arg(current_load)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("EXPIRE")
            .arg(&server_key)
            .arg(self.server_ttl_secs)
            .query_async(&mut conn)
            .await?;
        debug!(server_id, current_load, "heartbeat");
        Ok(())
    }

    pub async fn set_status(&self, server_id: &str, status: ServerStatus) -> Result<()> {
        let mut conn = self.store.conn().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(self.keys.server(server_id))
            .arg("status")
            .arg(status.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Bump the processed/failed counters on the server record.
    pub async fn record_outcome(&self, server_id: &str, failed: bool) -> Result<()> {
        let field = if failed { "totalFailed" } else { "totalProcessed" };
        let mut conn = self.store.conn().await?;
        let _: i64 = redis::cmd("HINCRBY")
            .arg(self.keys.server(server_id))
            .arg(field)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove the registration and mesh memberships.
    pub async fn deregister_server(&self, server_id: &str, mesh_ids: &[String]) -> Result<()> {
        let mut conn = self.store.conn().await?;
        for mesh_id in mesh_ids {
            let _: i64 = redis::cmd("SREM")
                .arg(self.keys.mesh_members(mesh_id))
                .arg(server_id)
                .query_async(&mut conn)
                .await?;
        }
        let _: i64 = redis::cmd("DEL")
            .arg(self.keys.server(server_id))
            .query_async(&mut conn)
            .await?;
        info!(server_id, "server deregistered");
        Ok(())
    }

    pub async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.server(server_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(server_info_from_map(&map)?))
    }

    /// Live servers in a mesh; dead entries are pruned from the members set
    /// as a side effect.
    pub async fn list_servers(&self, mesh_id: &str) -> Result<Vec<ServerInfo>> {
        let mut conn = self.store.conn().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.mesh_members(mesh_id))
            .query_async(&mut conn)
            .await?;
        drop(conn);

        let mut servers = Vec::new();
        for member in members {
            match self.get_server(&member).await? {
                Some(info) => servers.push(info),
                None => {
                    // TTL expired: the server is dead, drop the membership.
                    let mut conn = self.store.conn().await?;
                    let _: i64 = redis::cmd("SREM")
                        .arg(self.keys.mesh_members(mesh_id))
                        .arg(&member)
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        Ok(servers)
    }

    pub async fn get_mesh(&self, mesh_id: &str) -> Result<Option<MeshInfo>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.mesh(mesh_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(MeshInfo {
            id: map.get("id").cloned().unwrap_or_else(|| mesh_id.to_string()),
            name: map.get("name").cloned().unwrap_or_default(),
            description: map.get("description").cloned().unwrap_or_default(),
            created_at: map
                .get("createdAt")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            config: map
                .get("config")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(serde_json::Value::Null),
        }))
    }
}

fn server_info_from_map(map: &HashMap<String, String>) -> Result<ServerInfo> {
    let split_list = |field: &str| -> Vec<String> {
        map.get(field)
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(ServerInfo {
        server_id: map
            .get("id")
            .cloned()
            .ok_or_else(|| Error::StorageRead("server record missing id".to_string()))?,
        stack: map.get("stack").cloned().unwrap_or_default(),
        capabilities: split_list("capabilities"),
        mesh_ids: split_list("meshIds"),
        region: map.get("region").cloned().unwrap_or_default(),
        resources: map
            .get("resources")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or(serde_json::Value::Null),
        metadata: map
            .get("metadata")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or(serde_json::Value::Null),
        status: ServerStatus::parse(map.get("status").map(String::as_str).unwrap_or("online"))?,
        last_heartbeat: map
            .get("lastHeartbeat")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        current_load: map
            .get("currentLoad")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        total_processed: map
            .get("totalProcessed")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        total_failed: map
            .get("totalFailed")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    })
}
