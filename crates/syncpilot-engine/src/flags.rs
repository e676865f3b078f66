//! Feature flag evaluation.

use std::collections::BTreeMap;

use syncpilot_types::ConnectionContext;

use crate::config::types::FeatureFlagConfig;

/// Evaluates flags for a connection.
pub trait FeatureFlagClient: Send + Sync {
    fn bool_variation(&self, flag: &str, context: &ConnectionContext, default: bool) -> bool;

    fn int_variation(&self, flag: &str, context: &ConnectionContext, default: i64) -> i64;
}

/// Flags with fixed values for every connection, plus per-connection overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    booleans: BTreeMap<String, bool>,
    integers: BTreeMap<String, i64>,
    overrides: BTreeMap<(String, String), i64>,
}

impl StaticFeatureFlags {
    #[must_use]
    pub fn from_config(config: &FeatureFlagConfig) -> Self {
        Self {
            booleans: config.booleans.clone(),
            integers: config.integers.clone(),
            overrides: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_bool(mut self, flag: impl Into<String>, value: bool) -> Self {
        self.booleans.insert(flag.into(), value);
        self
    }

    #[must_use]
    pub fn with_int(mut self, flag: impl Into<String>, value: i64) -> Self {
        self.integers.insert(flag.into(), value);
        self
    }

    /// Integer value for one connection only.
    #[must_use]
    pub fn with_connection_int(
        mut self,
        flag: impl Into<String>,
        context: &ConnectionContext,
        value: i64,
    ) -> Self {
        self.overrides
            .insert((flag.into(), context.connection_id.to_string()), value);
        self
    }
}

impl FeatureFlagClient for StaticFeatureFlags {
    fn bool_variation(&self, flag: &str, _context: &ConnectionContext, default: bool) -> bool {
        self.booleans.get(flag).copied().unwrap_or(default)
    }

    fn int_variation(&self, flag: &str, context: &ConnectionContext, default: i64) -> i64 {
        self.overrides
            .get(&(flag.to_string(), context.connection_id.to_string()))
            .or_else(|| self.integers.get(flag))
            .copied()
            .unwrap_or(default)
    }
}
