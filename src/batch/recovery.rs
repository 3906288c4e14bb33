//! Detection of runs whose process died

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore, CommitRequest, RunStatus};
use crate::Result;

/// Mark `running` runs without a commit for `stale_after` as `interrupted`
///
/// The update goes through `commit_progress` with the cursor read from the
/// store, so a run that commits concurrently wins and is left alone. Returns
/// the ids of the runs that were marked.
#[instrument(skip(store))]
pub async fn recover_stale_runs(
    store: &dyn CheckpointStore,
    source_id: Option<&str>,
    stale_after: Duration,
) -> Result<Vec<String>> {
    let cutoff = match chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
    {
        Some(cutoff) => cutoff,
        None => {
            // older than any representable timestamp: nothing can be stale
            debug!(?stale_after, "Stale threshold out of range; no runs recovered");
            return Ok(Vec::new());
        }
    };
    let mut recovered = Vec::new();

    for run in store.list_incomplete_runs(source_id).await? {
        if run.status != RunStatus::Running || run.updated_at > cutoff {
            continue;
        }

        let request = CommitRequest::status_only(run.cursor.clone(), RunStatus::Interrupted);
        match store.commit_progress(&run.run_id, request).await {
            Ok(_) => {
                info!(
                    run_id = %run.run_id,
                    source_id = %run.source_id,
                    last_update = %run.updated_at,
                    "Marked stale run as interrupted"
                );
                recovered.push(run.run_id);
            }
            Err(CheckpointError::StaleCheckpoint { .. } | CheckpointError::InvalidTransition { .. }) => {
                warn!(run_id = %run.run_id, "Run changed while recovering; skipped");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(recovered)
}
