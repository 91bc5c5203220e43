//! Capability registry
//!
//! Capabilities are declared by providers at startup through an explicit
//! registration table: each provider returns its metadata from `describe()`
//! and the registry aggregates everything into three indices (actions,
//! static resources, templated resources). The set is immutable after
//! startup, so serving never takes a lock on it. Adding a capability means
//! restarting the server.

pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AlmanacError, Result};
pub use template::{ParamMap, UriTemplate};

/// How a capability is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Invoked by name via tools/call
    Action,
    /// Read via one fixed literal address
    StaticResource,
    /// Read via a pattern with named variable slots
    TemplatedResource,
}

/// Declared parameter type, validated at the dispatcher boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
        }
    }
}

/// One declared parameter of a capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamDescriptor {
    pub fn required(name: &str, param_type: ParamType) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, default: Option<Value>) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: false,
            default,
            description: None,
        }
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }
}

/// An invocable action or readable resource exposed by the server.
/// Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Unique within its kind: tool name, or resource address/pattern
    pub id: String,
    pub kind: CapabilityKind,
    pub name: String,
    pub description: String,
    pub params: Vec<ParamDescriptor>,
    pub mime_type: String,
    /// Scope a caller must hold to invoke this capability
    pub required_scope: String,
}

impl Capability {
    pub fn action(id: &str, description: &str, required_scope: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: CapabilityKind::Action,
            name: id.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            mime_type: "application/json".to_string(),
            required_scope: required_scope.to_string(),
        }
    }

    pub fn static_resource(uri: &str, name: &str, description: &str, required_scope: &str) -> Self {
        Self {
            id: uri.to_string(),
            kind: CapabilityKind::StaticResource,
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            mime_type: "application/json".to_string(),
            required_scope: required_scope.to_string(),
        }
    }

    pub fn templated_resource(
        pattern: &str,
        name: &str,
        description: &str,
        required_scope: &str,
    ) -> Self {
        Self {
            id: pattern.to_string(),
            kind: CapabilityKind::TemplatedResource,
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            mime_type: "application/json".to_string(),
            required_scope: required_scope.to_string(),
        }
    }

    pub fn with_params(mut self, params: Vec<ParamDescriptor>) -> Self {
        self.params = params;
        self
    }

    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.mime_type = mime_type.to_string();
        self
    }

    /// JSON Schema for the tools/list inputSchema field
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = serde_json::Map::new();
            prop.insert("type".to_string(), Value::String(param.param_type.as_str().to_string()));
            if let Some(desc) = &param.description {
                prop.insert("description".to_string(), Value::String(desc.clone()));
            }
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        let mut schema = serde_json::Map::new();
        schema.insert("type".to_string(), Value::String("object".to_string()));
        schema.insert("properties".to_string(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".to_string(), Value::Array(required));
        }
        Value::Object(schema)
    }
}

/// Contents returned from reading a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub text: String,
}

/// External collaborator contract: each business-logic module (search,
/// analytics, health) implements this and is handed to the registry at
/// startup.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Provider name, used for dispatch attribution and health reporting
    fn name(&self) -> &str;

    /// Declared capabilities; scanned exactly once at registration
    fn describe(&self) -> Vec<Capability>;

    /// Invoke an action declared by this provider
    async fn invoke(&self, name: &str, args: &serde_json::Map<String, Value>) -> Result<Value>;

    /// Read a resource declared by this provider. `params` carries template
    /// bindings; empty for static resources.
    async fn read(&self, uri: &str, params: &ParamMap) -> Result<ResourceContents>;
}

/// A registered templated resource with its compiled template
struct TemplateEntry {
    template: UriTemplate,
    capability: Capability,
    provider: Arc<dyn CapabilityProvider>,
}

/// The outcome of resolving a templated address
pub struct ResolvedResource {
    pub capability: Capability,
    pub provider: Arc<dyn CapabilityProvider>,
    pub params: ParamMap,
}

/// Immutable capability registry, built once at startup
pub struct CapabilityRegistry {
    actions: HashMap<String, (Capability, Arc<dyn CapabilityProvider>)>,
    statics: HashMap<String, (Capability, Arc<dyn CapabilityProvider>)>,
    templates: Vec<TemplateEntry>,
    // Declaration order for stable discovery snapshots
    action_order: Vec<String>,
    static_order: Vec<String>,
}

impl CapabilityRegistry {
    /// Build the registry from a fixed set of providers. Fails on duplicate
    /// identities and on any pair of templates that could both match one
    /// address - serving undefined routing is worse than refusing to start.
    pub fn build(providers: Vec<Arc<dyn CapabilityProvider>>) -> Result<Self> {
        let mut registry = Self {
            actions: HashMap::new(),
            statics: HashMap::new(),
            templates: Vec::new(),
            action_order: Vec::new(),
            static_order: Vec::new(),
        };
        for provider in providers {
            registry.register(provider)?;
        }
        Ok(registry)
    }

    fn register(&mut self, provider: Arc<dyn CapabilityProvider>) -> Result<()> {
        for capability in provider.describe() {
            match capability.kind {
                CapabilityKind::Action => {
                    if self.actions.contains_key(&capability.id) {
                        return Err(AlmanacError::Config(format!(
                            "duplicate action '{}'",
                            capability.id
                        )));
                    }
                    self.action_order.push(capability.id.clone());
                    self.actions
                        .insert(capability.id.clone(), (capability, provider.clone()));
                }
                CapabilityKind::StaticResource => {
                    if self.statics.contains_key(&capability.id) {
                        return Err(AlmanacError::Config(format!(
                            "duplicate static resource '{}'",
                            capability.id
                        )));
                    }
                    self.static_order.push(capability.id.clone());
                    self.statics
                        .insert(capability.id.clone(), (capability, provider.clone()));
                }
                CapabilityKind::TemplatedResource => {
                    let template = UriTemplate::compile(&capability.id)?;
                    for existing in &self.templates {
                        if existing.template.overlaps(&template) {
                            return Err(AlmanacError::AmbiguousTemplates(format!(
                                "'{}' collides with '{}'",
                                capability.id,
                                existing.template.pattern()
                            )));
                        }
                    }
                    self.templates.push(TemplateEntry {
                        template,
                        capability,
                        provider: provider.clone(),
                    });
                }
            }
        }
        tracing::info!(provider = provider.name(), "registered capability provider");
        Ok(())
    }

    /// Actions in declaration order
    pub fn list_actions(&self) -> Vec<&Capability> {
        self.action_order
            .iter()
            .filter_map(|id| self.actions.get(id).map(|(c, _)| c))
            .collect()
    }

    /// Static resources in declaration order
    pub fn list_static_resources(&self) -> Vec<&Capability> {
        self.static_order
            .iter()
            .filter_map(|id| self.statics.get(id).map(|(c, _)| c))
            .collect()
    }

    /// Templated resources in declaration order
    pub fn list_templates(&self) -> Vec<(&UriTemplate, &Capability)> {
        self.templates
            .iter()
            .map(|e| (&e.template, &e.capability))
            .collect()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn resource_count(&self) -> usize {
        self.statics.len() + self.templates.len()
    }

    /// O(1) lookup of an action by name
    pub fn resolve_action(&self, name: &str) -> Option<(&Capability, &Arc<dyn CapabilityProvider>)> {
        self.actions.get(name).map(|(c, p)| (c, p))
    }

    /// O(1) lookup of a static resource by exact address
    pub fn resolve_static(&self, uri: &str) -> Option<(&Capability, &Arc<dyn CapabilityProvider>)> {
        self.statics.get(uri).map(|(c, p)| (c, p))
    }

    /// Match an address against all templates. Linear in the template count,
    /// which stays in the tens here; a literal-prefix trie is the scaling
    /// path past ~100 templates.
    ///
    /// More than one match means registration-time checking was evaded;
    /// that is a configuration defect and fails loudly, never
    /// first-match-wins.
    pub fn resolve_templated(&self, uri: &str) -> Result<ResolvedResource> {
        let mut matches = Vec::new();
        for entry in &self.templates {
            if let Some(params) = entry.template.match_uri(uri) {
                matches.push((entry, params));
            }
        }
        if matches.len() > 1 {
            let n = matches.len();
            tracing::error!(uri, matches = n, "address matched multiple templates");
            return Err(AlmanacError::AmbiguousTemplates(format!(
                "address '{uri}' matched {n} templates"
            )));
        }
        match matches.pop() {
            None => Err(AlmanacError::NotFound(format!("resource '{uri}'"))),
            Some((entry, params)) => Ok(ResolvedResource {
                capability: entry.capability.clone(),
                provider: entry.provider.clone(),
                params,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        capabilities: Vec<Capability>,
    }

    #[async_trait]
    impl CapabilityProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn describe(&self) -> Vec<Capability> {
            self.capabilities.clone()
        }

        async fn invoke(&self, _name: &str, _args: &serde_json::Map<String, Value>) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn read(&self, uri: &str, _params: &ParamMap) -> Result<ResourceContents> {
            Ok(ResourceContents {
                uri: uri.to_string(),
                mime_type: "application/json".to_string(),
                text: "{}".to_string(),
            })
        }
    }

    fn provider(capabilities: Vec<Capability>) -> Arc<dyn CapabilityProvider> {
        Arc::new(FakeProvider { capabilities })
    }

    #[test]
    fn test_indices_are_disjoint() {
        let registry = CapabilityRegistry::build(vec![provider(vec![
            Capability::action("kb_search", "search", "kb.search"),
            Capability::static_resource("sys://health", "health", "health", "system.read"),
            Capability::templated_resource("kb://{id}/stats", "stats", "stats", "kb.read"),
        ])])
        .unwrap();

        assert_eq!(registry.list_actions().len(), 1);
        assert_eq!(registry.list_static_resources().len(), 1);
        assert_eq!(registry.list_templates().len(), 1);
        assert_eq!(registry.list_static_resources()[0].id, "sys://health");
        assert_eq!(registry.list_templates()[0].1.id, "kb://{id}/stats");
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let result = CapabilityRegistry::build(vec![provider(vec![
            Capability::action("kb_search", "one", "kb.search"),
            Capability::action("kb_search", "two", "kb.search"),
        ])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_colliding_templates_refuse_startup() {
        let result = CapabilityRegistry::build(vec![provider(vec![
            Capability::templated_resource("kb://{a}/stats", "a", "a", "kb.read"),
            Capability::templated_resource("kb://{b}/stats", "b", "b", "kb.read"),
        ])]);
        assert!(matches!(result, Err(AlmanacError::AmbiguousTemplates(_))));
    }

    #[test]
    fn test_resolve_templated_extracts_params() {
        let registry = CapabilityRegistry::build(vec![provider(vec![
            Capability::templated_resource("kb://{collection}/stats", "stats", "s", "kb.read"),
        ])])
        .unwrap();

        let resolved = registry.resolve_templated("kb://alpha/stats").unwrap();
        assert_eq!(
            resolved.params.get("collection").map(String::as_str),
            Some("alpha")
        );

        let miss = registry.resolve_templated("kb://alpha/missing");
        assert!(matches!(miss, Err(AlmanacError::NotFound(_))));
    }

    #[test]
    fn test_input_schema_shape() {
        let cap = Capability::action("kb_search", "search", "kb.search").with_params(vec![
            ParamDescriptor::required("query", ParamType::String),
            ParamDescriptor::optional("limit", ParamType::Integer, Some(serde_json::json!(10))),
        ]);
        let schema = cap.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["required"], serde_json::json!(["query"]));
    }
}
