use serde_json::Value;
use sluice_error::{ErrorCode, ErrorContext, SluiceError};

#[test]
fn test_json_serialization() {
    let error = SluiceError::new(ErrorCode::CircuitOpen, "Circuit breaker 'olap' is open")
        .with_context(ErrorContext::CircuitOpen {
            breaker: "olap".to_string(),
            retry_after_ms: 4000,
        })
        .with_hint("Retry after 4000ms");

    let json = error.to_json();
    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "SLUICE-1005");
    assert_eq!(v["message"], "Circuit breaker 'olap' is open");
    assert_eq!(v["hint"], "Retry after 4000ms");
    assert_eq!(v["context"]["type"], "circuit_open");
    assert_eq!(v["context"]["retry_after_ms"], 4000);
}

#[test]
fn test_error_roundtrip_preserves_retry_hint() {
    let error = SluiceError::new(ErrorCode::CircuitOpen, "open").with_context(
        ErrorContext::CircuitOpen {
            breaker: "oltp".to_string(),
            retry_after_ms: 250,
        },
    );
    let decoded: SluiceError = serde_json::from_str(&error.to_json()).unwrap();
    assert_eq!(decoded.code, ErrorCode::CircuitOpen);
    assert_eq!(
        decoded.retry_after(),
        Some(std::time::Duration::from_millis(250))
    );
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "SLUICE-1004".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::PoolExhausted);
}
