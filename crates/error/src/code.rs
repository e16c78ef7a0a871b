use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following SLUICE-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Store and connection errors
/// - **2000-2999**: Query and execution errors
/// - **3000-3999**: Configuration and administration errors
/// - **4000-4999**: Quota and scheduling errors
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Store Errors (1000-1999) ===
    /// SLUICE-1001: Backing store not registered
    StoreNotFound = 1001,
    /// SLUICE-1002: Connecting to a store timed out
    ConnectionTimeout = 1002,
    /// SLUICE-1003: Store did not answer a ping
    StoreUnavailable = 1003,
    /// SLUICE-1004: Connection pool exhausted
    PoolExhausted = 1004,
    /// SLUICE-1005: Circuit breaker is open for the store
    CircuitOpen = 1005,

    // === Query Errors (2000-2999) ===
    /// SLUICE-2001: Store rejected or failed the query
    ExecutionFailed = 2001,
    /// SLUICE-2002: Query exceeded its timeout
    ExecutionTimeout = 2002,
    /// SLUICE-2003: Query text is empty or malformed
    InvalidQuery = 2003,
    /// SLUICE-2004: Classification could not be completed
    ClassificationFailed = 2004,
    /// SLUICE-2005: A rewrite rule failed
    OptimizationFailed = 2005,
    /// SLUICE-2006: Cost estimation failed
    CostEstimationFailed = 2006,
    /// SLUICE-2007: Rewritten query returned different rows
    ShadowMismatch = 2007,
    /// SLUICE-2008: Query cancelled by caller
    QueryCancelled = 2008,

    // === Configuration Errors (3000-3999) ===
    /// SLUICE-3001: Invalid YAML syntax
    InvalidYaml = 3001,
    /// SLUICE-3002: Configuration validation failed
    SchemaViolation = 3002,
    /// SLUICE-3003: Missing required field in config
    MissingRequiredField = 3003,
    /// SLUICE-3004: Configuration could not be loaded
    InvalidConfig = 3004,
    /// SLUICE-3005: Optimization rule not found
    UnknownRule = 3005,

    // === Quota Errors (4000-4999) ===
    /// SLUICE-4001: Tenant exceeded its daily query cap
    QuotaExceeded = 4001,
    /// SLUICE-4002: Scheduler queue is full
    QueueFull = 4002,
    /// SLUICE-4003: No execution with that id
    UnknownQuery = 4003,
    /// SLUICE-4004: Scheduler is shutting down
    SchedulerShutdown = 4004,

    // === Internal Errors (5000-5999) ===
    /// SLUICE-5001: Cache tier unavailable
    CacheUnavailable = 5001,
    /// SLUICE-5002: Serialization/deserialization failed
    SerializationFailed = 5002,
    /// SLUICE-5003: Unexpected internal state
    Internal = 5003,
    /// SLUICE-5004: Feature not implemented
    NotImplemented = 5004,

    /// SLUICE-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "SLUICE-2002")
    pub fn as_str(&self) -> String {
        format!("SLUICE-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Store,
            2000..=2999 => ErrorCategory::Query,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Quota,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("SLUICE-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::StoreNotFound),
            1002 => Ok(Self::ConnectionTimeout),
            1003 => Ok(Self::StoreUnavailable),
            1004 => Ok(Self::PoolExhausted),
            1005 => Ok(Self::CircuitOpen),
            2001 => Ok(Self::ExecutionFailed),
            2002 => Ok(Self::ExecutionTimeout),
            2003 => Ok(Self::InvalidQuery),
            2004 => Ok(Self::ClassificationFailed),
            2005 => Ok(Self::OptimizationFailed),
            2006 => Ok(Self::CostEstimationFailed),
            2007 => Ok(Self::ShadowMismatch),
            2008 => Ok(Self::QueryCancelled),
            3001 => Ok(Self::InvalidYaml),
            3002 => Ok(Self::SchemaViolation),
            3003 => Ok(Self::MissingRequiredField),
            3004 => Ok(Self::InvalidConfig),
            3005 => Ok(Self::UnknownRule),
            4001 => Ok(Self::QuotaExceeded),
            4002 => Ok(Self::QueueFull),
            4003 => Ok(Self::UnknownQuery),
            4004 => Ok(Self::SchedulerShutdown),
            5001 => Ok(Self::CacheUnavailable),
            5002 => Ok(Self::SerializationFailed),
            5003 => Ok(Self::Internal),
            5004 => Ok(Self::NotImplemented),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Store,
    Query,
    Config,
    Quota,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::StoreNotFound.as_str(), "SLUICE-1001");
        assert_eq!(ErrorCode::ExecutionFailed.as_str(), "SLUICE-2001");
        assert_eq!(ErrorCode::Unknown.as_str(), "SLUICE-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("SLUICE-1005".to_string()).unwrap(),
            ErrorCode::CircuitOpen
        );
        assert_eq!(
            ErrorCode::try_from("SLUICE-9999".to_string()).unwrap(),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn test_error_code_parsing_errors() {
        assert!(ErrorCode::try_from("INVALID".to_string()).is_err());
        assert!(ErrorCode::try_from("SLUICE-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("SLUICE-ABC".to_string()).is_err());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::PoolExhausted.category(), ErrorCategory::Store);
        assert_eq!(ErrorCode::ExecutionTimeout.category(), ErrorCategory::Query);
        assert_eq!(ErrorCode::InvalidYaml.category(), ErrorCategory::Config);
        assert_eq!(ErrorCode::QuotaExceeded.category(), ErrorCategory::Quota);
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Internal);
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Internal);
    }
}
