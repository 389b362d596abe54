//! Concurrent fan-out of one analyzer over a batch of media items.

use crate::analysis::analyzer::Base64Analyzer;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Analyze every input concurrently.
///
/// The result has the same length and order as `inputs`. A failed or
/// panicked item becomes an `Error: ...` string at its own index and
/// does not affect the others.
pub async fn analyze_batch(
    analyzer: Arc<dyn Base64Analyzer>,
    label: &str,
    inputs: Vec<String>,
) -> Vec<String> {
    let handles: Vec<_> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let analyzer = Arc::clone(&analyzer);
            let label = label.to_string();
            tokio::spawn(async move {
                debug!("Starting {} analysis {}", label, index + 1);
                let result = analyzer.analyze(&input, index).await;
                debug!("Finished {} analysis {}", label, index + 1);
                result
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, joined)| match joined {
            Ok(Ok(finding)) => finding,
            Ok(Err(e)) => {
                warn!("{} analysis {} failed: {:#}", label, index + 1, e);
                format!("Error: {:#}", e)
            }
            Err(e) => {
                warn!("{} analysis {} aborted: {}", label, index + 1, e);
                format!("Error: analysis task aborted: {}", e)
            }
        })
        .collect()
}
