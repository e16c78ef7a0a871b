//! # Error Contexts
//!
//! Structured metadata attached to errors for programmatic handling.

use serde::{Deserialize, Serialize};

/// Structured context for coded errors.
///
/// Each variant provides the fields relevant to that error family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for SLUICE-1005 (CircuitOpen)
    CircuitOpen {
        breaker: String,
        retry_after_ms: u64,
    },

    /// Context for pool errors (SLUICE-1002, 1004)
    Pool {
        store: String,
        active: usize,
        max_connections: usize,
        waited_ms: u64,
    },

    /// Context for SLUICE-2001/2002 (execution failures)
    Execution {
        store: String,
        transient: bool,
        attempts: u32,
    },

    /// Context for SLUICE-4001 (QuotaExceeded)
    Quota {
        tenant: String,
        limit: u64,
        used: u64,
    },

    /// Context for SLUICE-3001/3002 (config errors)
    Config {
        file_path: Option<String>,
        field: Option<String>,
    },

    /// Context for SLUICE-3005 (UnknownRule)
    Rule {
        rule: String,
        available_rules: Vec<String>,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_context_serde_roundtrip() {
        let ctx = ErrorContext::Pool {
            store: "olap".to_string(),
            active: 8,
            max_connections: 8,
            waited_ms: 250,
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"type\":\"pool\""));
        let de: ErrorContext = serde_json::from_str(&json).unwrap();

        match de {
            ErrorContext::Pool {
                store,
                max_connections,
                ..
            } => {
                assert_eq!(store, "olap");
                assert_eq!(max_connections, 8);
            }
            _ => panic!("Wrong variant"),
        }
    }
}
