//! Usage analytics provider
//!
//! Reads the dispatcher's audit trail - the attribution of every dispatch
//! to a capability identity - and reports per-capability invocation counts
//! and outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::scopes;
use crate::dispatch::AuditTrail;
use crate::error::{AlmanacError, Result};
use crate::registry::{
    Capability, CapabilityProvider, ParamDescriptor, ParamMap, ParamType, ResourceContents,
};

pub struct AnalyticsProvider {
    audit: Arc<AuditTrail>,
}

impl AnalyticsProvider {
    pub fn new(audit: Arc<AuditTrail>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl CapabilityProvider for AnalyticsProvider {
    fn name(&self) -> &str {
        "analytics"
    }

    fn describe(&self) -> Vec<Capability> {
        vec![
            Capability::action(
                "get_usage_analytics",
                "Per-capability invocation counts and outcomes",
                scopes::ANALYTICS_READ,
            )
            .with_params(vec![ParamDescriptor::optional(
                "top",
                ParamType::Integer,
                Some(json!(10)),
            )
            .describe("How many capabilities to report, busiest first")]),
            Capability::templated_resource(
                "stats://{capability}",
                "capability_stats",
                "Audit counters for one capability",
                scopes::ANALYTICS_READ,
            )
            .with_params(vec![ParamDescriptor::required(
                "capability",
                ParamType::String,
            )]),
        ]
    }

    async fn invoke(&self, name: &str, args: &Map<String, Value>) -> Result<Value> {
        match name {
            "get_usage_analytics" => {
                let top = args.get("top").and_then(Value::as_u64).unwrap_or(10) as usize;
                let mut records = self.audit.snapshot();
                records.sort_by(|a, b| b.total().cmp(&a.total()));
                records.truncate(top);
                Ok(json!({
                    "capabilities": records,
                    "tracked": self.audit.snapshot().len(),
                }))
            }
            other => Err(AlmanacError::NotFound(format!("tool '{other}'"))),
        }
    }

    async fn read(&self, uri: &str, params: &ParamMap) -> Result<ResourceContents> {
        let capability = params
            .get("capability")
            .ok_or_else(|| AlmanacError::NotFound(format!("resource '{uri}'")))?;
        let record = self
            .audit
            .record_for(capability)
            .ok_or_else(|| {
                AlmanacError::NotFound(format!("no dispatches recorded for '{capability}'"))
            })?;
        Ok(ResourceContents {
            uri: uri.to_string(),
            mime_type: "application/json".to_string(),
            text: serde_json::to_string_pretty(&record)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;

    #[tokio::test]
    async fn test_usage_sorted_by_volume() {
        let audit = Arc::new(AuditTrail::new());
        audit.record("kb_search", DispatchOutcome::Ok);
        audit.record("kb_search", DispatchOutcome::Ok);
        audit.record("get_system_health", DispatchOutcome::Ok);

        let provider = AnalyticsProvider::new(audit);
        let result = provider
            .invoke("get_usage_analytics", &Map::new())
            .await
            .unwrap();
        let capabilities = result["capabilities"].as_array().unwrap();
        assert_eq!(capabilities[0]["capability"], "kb_search");
        assert_eq!(capabilities[0]["ok"], 2);
    }

    #[tokio::test]
    async fn test_stats_resource_for_untracked_capability() {
        let provider = AnalyticsProvider::new(Arc::new(AuditTrail::new()));
        let mut params = ParamMap::new();
        params.insert("capability".to_string(), "kb_search".to_string());
        let err = provider
            .read("stats://kb_search", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, AlmanacError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stats_resource_reports_counters() {
        let audit = Arc::new(AuditTrail::new());
        audit.record("kb_search", DispatchOutcome::Ok);
        audit.record("kb_search", DispatchOutcome::Denied);

        let provider = AnalyticsProvider::new(audit);
        let mut params = ParamMap::new();
        params.insert("capability".to_string(), "kb_search".to_string());
        let contents = provider.read("stats://kb_search", &params).await.unwrap();
        let value: Value = serde_json::from_str(&contents.text).unwrap();
        assert_eq!(value["ok"], 1);
        assert_eq!(value["denied"], 1);
    }
}
