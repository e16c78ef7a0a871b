//! # Query Warnings
//!
//! Task-local warning collection for a single submission.
//!
//! Non-fatal conditions (store fallback, skipped rewrite, shadow mismatch) are
//! pushed from anywhere in the call tree and surface in the response. The
//! scope does not cross `tokio::spawn`; callers scope the future that runs on
//! the spawned task.

use std::future::Future;
use std::sync::{Arc, Mutex};

tokio::task_local! {
    pub static QUERY_WARNINGS: Arc<Mutex<Vec<String>>>;
}

/// Helper to add a warning to the current task's warning list, if active.
pub fn add_warning(warning: impl Into<String>) {
    if let Ok(warnings) = QUERY_WARNINGS.try_with(|w: &Arc<Mutex<Vec<String>>>| w.clone()) {
        if let Ok(mut lock) = warnings.lock() {
            lock.push(warning.into());
        }
    }
}

/// Run `fut` with a fresh warning list and return its output with the warnings.
pub async fn collect_warnings<F: Future>(fut: F) -> (F::Output, Vec<String>) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let output = QUERY_WARNINGS.scope(sink.clone(), fut).await;
    let warnings = sink.lock().map(|w| w.clone()).unwrap_or_default();
    (output, warnings)
}
