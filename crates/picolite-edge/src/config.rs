//! Runtime configuration loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RegistrationError;
use crate::registry::{OpKind, OpRegistry, DEFAULT_CAPACITY};

/// Default arena size in bytes.
pub const DEFAULT_ARENA_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Interpreter settings.
///
/// ```json
/// { "arena_size": 32768, "registry_capacity": 16, "ops": ["Conv2D", "Relu"] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Arena size in bytes.
    pub arena_size: usize,

    /// Maximum number of registered operators.
    pub registry_capacity: usize,

    /// Operators to register. Empty registers every built-in kernel.
    pub ops: Vec<OpKind>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { arena_size: DEFAULT_ARENA_SIZE, registry_capacity: DEFAULT_CAPACITY, ops: Vec::new() }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_json_str(&text)
    }

    /// A registry populated according to `ops`.
    pub fn build_registry(&self) -> Result<OpRegistry, ConfigError> {
        let mut registry = OpRegistry::with_capacity(self.registry_capacity);
        if self.ops.is_empty() {
            registry.register_all_builtins()?;
        } else {
            for &kind in &self.ops {
                registry.register(kind)?;
            }
        }
        tracing::debug!(ops = registry.len(), capacity = registry.capacity(), "built registry from config");
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OperatorCode;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.arena_size, 64 * 1024);
        assert_eq!(cfg.registry_capacity, 128);
    }

    #[test]
    fn test_explicit_ops() {
        let cfg = RuntimeConfig::from_json_str(r#"{"arena_size": 1024, "ops": ["Add", "Relu"]}"#).unwrap();
        assert_eq!(cfg.arena_size, 1024);
        let reg = cfg.build_registry().unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.contains(&OperatorCode::Builtin(OpKind::Relu)));
    }

    #[test]
    fn test_unknown_op_is_parse_error() {
        let err = RuntimeConfig::from_json_str(r#"{"ops": ["NoSuchOp"]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(RuntimeConfig::from_json_str(r#"{"arena": 5}"#).is_err());
    }

    #[test]
    fn test_capacity_applies() {
        let cfg = RuntimeConfig { registry_capacity: 1, ops: vec![OpKind::Add, OpKind::Sub], ..Default::default() };
        assert!(matches!(
            cfg.build_registry(),
            Err(ConfigError::Registration(RegistrationError::CapacityExceeded { capacity: 1 }))
        ));
    }

    #[test]
    fn test_all_builtins_by_default() {
        let reg = RuntimeConfig::default().build_registry().unwrap();
        assert_eq!(reg.len(), crate::ops::BUILTIN_KERNELS.len());
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::from_json_file("/nonexistent/picolite.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
