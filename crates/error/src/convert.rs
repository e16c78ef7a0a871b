use crate::{ErrorCode, ErrorContext, SluiceError};

impl From<std::io::Error> for SluiceError {
    fn from(err: std::io::Error) -> Self {
        SluiceError::new(ErrorCode::CacheUnavailable, err.to_string())
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<serde_yaml::Error> for SluiceError {
    fn from(err: serde_yaml::Error) -> Self {
        SluiceError::new(ErrorCode::InvalidYaml, err.to_string())
    }
}

impl From<config::ConfigError> for SluiceError {
    fn from(err: config::ConfigError) -> Self {
        let field = match &err {
            config::ConfigError::NotFound(key) => Some(key.clone()),
            config::ConfigError::Type { key, .. } => key.clone(),
            _ => None,
        };
        SluiceError::new(ErrorCode::InvalidConfig, err.to_string()).with_context(
            ErrorContext::Config {
                file_path: None,
                field,
            },
        )
    }
}

impl From<validator::ValidationErrors> for SluiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field = err.field_errors().keys().next().map(|k| k.to_string());
        SluiceError::new(ErrorCode::SchemaViolation, err.to_string()).with_context(
            ErrorContext::Config {
                file_path: None,
                field,
            },
        )
    }
}

/// Closest option within an edit distance of 3, used for "did you mean" hints.
pub fn find_closest_match(target: &str, options: &[String]) -> Option<String> {
    let mut best_match: Option<&str> = None;
    let mut min_distance = usize::MAX;

    for option in options {
        let distance = levenshtein(target, option);
        if distance < min_distance && distance <= 3 {
            min_distance = distance;
            best_match = Some(option.as_str());
        }
    }

    best_match.map(|s| s.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut dp = vec![vec![0; b.len() + 1]; a.len() + 1];

    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for (j, val) in dp[0].iter_mut().enumerate() {
        *val = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            dp[i][j] = std::cmp::min(
                std::cmp::min(dp[i - 1][j] + 1, dp[i][j - 1] + 1),
                dp[i - 1][j - 1] + cost,
            );
        }
    }

    dp[a.len()][b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("book", "back"), 2);
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_find_closest_match() {
        let options = vec![
            "append_limit".to_string(),
            "in_subquery_to_join".to_string(),
            "or_chain_to_in".to_string(),
        ];

        assert_eq!(
            find_closest_match("append_limit", &options),
            Some("append_limit".to_string())
        );
        assert_eq!(
            find_closest_match("apend_limit", &options),
            Some("append_limit".to_string())
        );
        assert_eq!(find_closest_match("completely_different", &options), None);
    }

    #[test]
    fn test_io_error_mapping() {
        let io_err = std::io::Error::other("disk full");
        let err: SluiceError = io_err.into();
        assert_eq!(err.code, ErrorCode::CacheUnavailable);
        assert!(err.message.contains("disk full"));
    }

    #[test]
    fn test_config_error_mapping() {
        let err: SluiceError = config::ConfigError::NotFound("router.default_store".into()).into();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
        match err.context {
            Some(ErrorContext::Config { field, .. }) => {
                assert_eq!(field.as_deref(), Some("router.default_store"))
            }
            _ => panic!("Expected Config context"),
        }
    }
}
