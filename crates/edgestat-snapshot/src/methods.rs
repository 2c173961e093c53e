//! HTTP method enrichment for snapshot rows
//!
//! Priority: the most frequent method observed in recent raw events, then
//! the configured method, then nothing. An observed method is written back
//! to the path configuration only over an unset or placeholder value.

use edgestat_core::SnapshotRow;
use edgestat_storage::{EventStore, PathConfigStore, WriteBack};

use crate::error::Result;

/// Write-back counters of one enrichment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub written_back: usize,
    pub conflicts: usize,
    pub failures: usize,
}

/// Method to display and whether the observed method should be written back.
pub(crate) fn resolve(
    observed: Option<&str>,
    configured: Option<&str>,
    placeholder: &str,
) -> (Option<String>, bool) {
    match (observed, configured) {
        (Some(seen), current) => {
            let replaceable = current.map_or(true, |c| c == placeholder);
            let write_back = replaceable && current != Some(seen);
            (Some(seen.to_string()), write_back)
        }
        (None, Some(current)) => (Some(current.to_string()), false),
        (None, None) => (None, false),
    }
}

/// Fill `rows[..].method` in place.
///
/// Write-back failures and conflicts are logged and counted, never
/// returned; only the reads feeding the enrichment can fail the pass.
pub(crate) async fn enrich(
    rows: &mut [SnapshotRow],
    events: &EventStore,
    configs: &PathConfigStore,
    since_ms: i64,
    placeholder: &str,
) -> Result<EnrichmentStats> {
    let paths: Vec<String> = rows.iter().map(|row| row.path.clone()).collect();
    let observed = events.most_frequent_methods(since_ms, &paths).await?;
    let configured = configs.get_many(&paths).await?;

    let mut stats = EnrichmentStats::default();
    for row in rows.iter_mut() {
        let seen = observed.get(&row.path).map(String::as_str);
        let current = configured
            .get(&row.path)
            .and_then(|config| config.method.as_deref());
        let (method, write_back) = resolve(seen, current, placeholder);
        row.method = method;

        let Some(method) = row.method.as_deref().filter(|_| write_back) else {
            continue;
        };
        match configs.write_back_method(&row.path, method, placeholder).await {
            Ok(WriteBack::Written) => {
                stats.written_back += 1;
                tracing::debug!(path = %row.path, method, "Inferred method written back");
            }
            Ok(WriteBack::Conflict) => {
                stats.conflicts += 1;
                tracing::info!(
                    path = %row.path,
                    method,
                    "Path method was edited concurrently, write-back skipped"
                );
            }
            Err(e) => {
                stats.failures += 1;
                tracing::warn!(path = %row.path, error = %e, "Method write-back failed");
            }
        }
    }
    Ok(stats)
}

/// Configured methods only, for the degraded live read path.
pub(crate) async fn apply_configured(rows: &mut [SnapshotRow], configs: &PathConfigStore) -> Result<()> {
    let paths: Vec<String> = rows.iter().map(|row| row.path.clone()).collect();
    let configured = configs.get_many(&paths).await?;
    for row in rows.iter_mut() {
        row.method = configured
            .get(&row.path)
            .and_then(|config| config.method.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_method_wins() {
        assert_eq!(resolve(Some("POST"), None, "GET"), (Some("POST".into()), true));
        assert_eq!(resolve(Some("POST"), Some("GET"), "GET"), (Some("POST".into()), true));
        assert_eq!(resolve(Some("GET"), Some("GET"), "GET"), (Some("GET".into()), false));
    }

    #[test]
    fn test_manual_value_is_never_replaced() {
        assert_eq!(
            resolve(Some("POST"), Some("PATCH"), "GET"),
            (Some("POST".into()), false)
        );
    }

    #[test]
    fn test_configured_then_unset() {
        assert_eq!(resolve(None, Some("PUT"), "GET"), (Some("PUT".into()), false));
        assert_eq!(resolve(None, None, "GET"), (None, false));
    }
}
