//! Knowledge-base search provider
//!
//! Serves `kb_search` plus the `kb://` resource family over an in-memory
//! collection store. Ranking is a plain keyword overlap score - the point
//! of this provider is the capability surface, not retrieval quality.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::scopes;
use crate::error::{AlmanacError, Result};
use crate::registry::{
    Capability, CapabilityProvider, ParamDescriptor, ParamMap, ParamType, ResourceContents,
};

/// One entry in a knowledge collection
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub id: String,
    pub title: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SearchProvider {
    collections: RwLock<BTreeMap<String, Vec<Entry>>>,
}

impl SearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeded with a small corpus so a fresh server has something to serve
    pub fn with_sample_data() -> Self {
        let provider = Self::new();
        provider.insert(
            "alpha",
            Entry {
                id: "1".to_string(),
                title: "Capability registries".to_string(),
                body: "Registries index actions and resources discovered at startup".to_string(),
                updated_at: Utc::now(),
            },
        );
        provider.insert(
            "alpha",
            Entry {
                id: "2".to_string(),
                title: "URI templates".to_string(),
                body: "Templates bind named variables from concrete addresses".to_string(),
                updated_at: Utc::now(),
            },
        );
        provider.insert(
            "ops",
            Entry {
                id: "1".to_string(),
                title: "Token audiences".to_string(),
                body: "A token minted for another audience must never be accepted".to_string(),
                updated_at: Utc::now(),
            },
        );
        provider
    }

    pub fn insert(&self, collection: &str, entry: Entry) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(entry);
    }

    fn search(&self, query: &str, collection: Option<&str>, limit: usize) -> Value {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let collections = self.collections.read();

        let mut hits: Vec<(i64, Value)> = Vec::new();
        for (name, entries) in collections.iter() {
            if let Some(wanted) = collection {
                if name != wanted {
                    continue;
                }
            }
            for entry in entries {
                let title = entry.title.to_lowercase();
                let body = entry.body.to_lowercase();
                // Title hits count double
                let score: i64 = terms
                    .iter()
                    .map(|t| 2 * title.matches(t.as_str()).count() as i64
                        + body.matches(t.as_str()).count() as i64)
                    .sum();
                if score > 0 {
                    hits.push((
                        score,
                        json!({
                            "collection": name,
                            "id": entry.id,
                            "title": entry.title,
                            "score": score,
                            "snippet": entry.body,
                        }),
                    ));
                }
            }
        }
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        let results: Vec<Value> = hits.into_iter().take(limit).map(|(_, v)| v).collect();
        json!({ "query": query, "total": results.len(), "results": results })
    }

    fn stats(&self, collection: &str) -> Result<Value> {
        let collections = self.collections.read();
        let entries = collections
            .get(collection)
            .ok_or_else(|| AlmanacError::NotFound(format!("collection '{collection}'")))?;
        let last_updated = entries.iter().map(|e| e.updated_at).max();
        Ok(json!({
            "collection": collection,
            "entries": entries.len(),
            "last_updated": last_updated,
        }))
    }

    fn entry(&self, collection: &str, id: &str) -> Result<Value> {
        let collections = self.collections.read();
        let entries = collections
            .get(collection)
            .ok_or_else(|| AlmanacError::NotFound(format!("collection '{collection}'")))?;
        let entry = entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| {
                AlmanacError::NotFound(format!("entry '{id}' in collection '{collection}'"))
            })?;
        Ok(serde_json::to_value(entry)?)
    }
}

#[async_trait]
impl CapabilityProvider for SearchProvider {
    fn name(&self) -> &str {
        "search"
    }

    fn describe(&self) -> Vec<Capability> {
        vec![
            Capability::action("kb_search", "Search the knowledge base", scopes::KB_SEARCH)
                .with_params(vec![
                    ParamDescriptor::required("query", ParamType::String)
                        .describe("Search terms"),
                    ParamDescriptor::optional("collection", ParamType::String, None)
                        .describe("Restrict to one collection"),
                    ParamDescriptor::optional("limit", ParamType::Integer, Some(json!(10)))
                        .describe("Maximum results"),
                ]),
            Capability::static_resource(
                "kb://collections",
                "collections",
                "All knowledge collections with entry counts",
                scopes::KB_READ,
            ),
            Capability::templated_resource(
                "kb://{collection}/stats",
                "collection_stats",
                "Entry count and freshness for one collection",
                scopes::KB_READ,
            )
            .with_params(vec![ParamDescriptor::required("collection", ParamType::String)]),
            Capability::templated_resource(
                "kb://{collection}/entries/{id}",
                "collection_entry",
                "A single knowledge entry",
                scopes::KB_READ,
            )
            .with_params(vec![
                ParamDescriptor::required("collection", ParamType::String),
                ParamDescriptor::required("id", ParamType::String),
            ]),
        ]
    }

    async fn invoke(&self, name: &str, args: &Map<String, Value>) -> Result<Value> {
        match name {
            "kb_search" => {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AlmanacError::InvalidParams("'query' is required".into()))?;
                let collection = args.get("collection").and_then(Value::as_str);
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(10) as usize;
                Ok(self.search(query, collection, limit))
            }
            other => Err(AlmanacError::NotFound(format!("tool '{other}'"))),
        }
    }

    async fn read(&self, uri: &str, params: &ParamMap) -> Result<ResourceContents> {
        let value = if uri == "kb://collections" {
            let collections = self.collections.read();
            let listing: Vec<Value> = collections
                .iter()
                .map(|(name, entries)| json!({"name": name, "entries": entries.len()}))
                .collect();
            json!({ "collections": listing })
        } else {
            let collection = params
                .get("collection")
                .ok_or_else(|| AlmanacError::NotFound(format!("resource '{uri}'")))?;
            match params.get("id") {
                Some(id) => self.entry(collection, id)?,
                None => self.stats(collection)?,
            }
        };
        Ok(ResourceContents {
            uri: uri.to_string(),
            mime_type: "application/json".to_string(),
            text: serde_json::to_string_pretty(&value)?,
        })
    }
}
