//! Built-in capability providers
//!
//! Each provider is one business-logic module behind the
//! `CapabilityProvider` boundary: it declares its capabilities in
//! `describe()` and serves them from `invoke()`/`read()`. Ranking quality,
//! health heuristics, and analytics formatting live entirely in here; the
//! protocol core neither knows nor cares.

pub mod analytics;
pub mod health;
pub mod search;

pub use analytics::AnalyticsProvider;
pub use health::HealthProvider;
pub use search::SearchProvider;

/// Scopes required by the built-in capabilities
pub mod scopes {
    pub const KB_SEARCH: &str = "kb.search";
    pub const KB_READ: &str = "kb.read";
    pub const SYSTEM_READ: &str = "system.read";
    pub const ANALYTICS_READ: &str = "analytics.read";
}
