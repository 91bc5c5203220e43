//! System health provider
//!
//! Aggregates a status for every named dependency into one report, served
//! both as the `get_system_health` action and the `sys://health` static
//! resource. Per-dependency probing heuristics live behind `probe`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use super::scopes;
use crate::error::{AlmanacError, Result};
use crate::registry::{Capability, CapabilityProvider, ParamMap, ResourceContents};

pub struct HealthProvider {
    started: DateTime<Utc>,
    dependencies: Vec<String>,
}

impl HealthProvider {
    pub fn new(dependencies: Vec<String>) -> Self {
        Self {
            started: Utc::now(),
            dependencies,
        }
    }

    fn probe(&self, _dependency: &str) -> &'static str {
        // In-process collaborators have no failure mode to observe yet
        "ok"
    }

    fn report(&self) -> Value {
        let dependencies: Vec<Value> = self
            .dependencies
            .iter()
            .map(|name| json!({"name": name, "status": self.probe(name)}))
            .collect();
        let degraded = dependencies
            .iter()
            .any(|d| d["status"] != "ok");
        json!({
            "status": if degraded { "degraded" } else { "ok" },
            "uptime_seconds": (Utc::now() - self.started).num_seconds(),
            "started_at": self.started,
            "dependencies": dependencies,
        })
    }
}

#[async_trait]
impl CapabilityProvider for HealthProvider {
    fn name(&self) -> &str {
        "health"
    }

    fn describe(&self) -> Vec<Capability> {
        vec![
            Capability::action(
                "get_system_health",
                "Aggregated dependency statuses and uptime",
                scopes::SYSTEM_READ,
            ),
            Capability::static_resource(
                "sys://health",
                "system_health",
                "Current system health report",
                scopes::SYSTEM_READ,
            ),
        ]
    }

    async fn invoke(&self, name: &str, _args: &Map<String, Value>) -> Result<Value> {
        match name {
            "get_system_health" => Ok(self.report()),
            other => Err(AlmanacError::NotFound(format!("tool '{other}'"))),
        }
    }

    async fn read(&self, uri: &str, _params: &ParamMap) -> Result<ResourceContents> {
        Ok(ResourceContents {
            uri: uri.to_string(),
            mime_type: "application/json".to_string(),
            text: serde_json::to_string_pretty(&self.report())?,
        })
    }
}
