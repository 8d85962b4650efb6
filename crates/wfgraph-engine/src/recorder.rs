//! Run lifecycle adapter: engine events to `RunLedger` persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use wfgraph_core::obs;
use wfgraph_state::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult,
};

/// Ledger event kinds written by the engine.
pub mod kinds {
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_SKIPPED: &str = "job.skipped";
    pub const JOB_FINISHED: &str = "job.finished";
    pub const INSTANCE_FINISHED: &str = "instance.finished";
    pub const STEP_FINISHED: &str = "step.finished";
    pub const ARTIFACT_UPLOADED: &str = "artifact.uploaded";
    pub const ARTIFACT_UPLOAD_FAILED: &str = "artifact.upload_failed";
}

/// Records one run into a [`RunLedger`].
///
/// Usage:
/// 1. [`RunRecorder::start`] creates the run.
/// 2. [`RunRecorder::record`] appends events; safe to share across job tasks.
/// 3. One of the `finish_*` methods finalizes it.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    next_seq: AtomicU64,
}

impl RunRecorder {
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let run_id = ledger.create_run(spec_digest, metadata.clone()).await?;
        obs::emit_run_started(&run_id.to_string(), &metadata.workflow, &metadata.event);
        Ok(Self {
            ledger,
            run_id,
            next_seq: AtomicU64::new(1),
        })
    }

    /// Append one event; sequence numbers are assigned here.
    pub async fn record(&self, kind: &str, payload: serde_json::Value) -> StorageResult<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        obs::emit_event_appended(&self.run_id.to_string(), kind, seq);
        self.ledger.append_event(&self.run_id, event).await
    }

    /// Events recorded so far.
    pub fn total_events(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    pub async fn finish_ok(&self, summary: RunSummary) -> StorageResult<()> {
        self.emit_finished(&summary);
        self.ledger.complete_run(&self.run_id, summary).await
    }

    pub async fn finish_err(&self, summary: RunSummary) -> StorageResult<()> {
        self.emit_finished(&summary);
        self.ledger.fail_run(&self.run_id, summary).await
    }

    pub async fn finish_cancelled(&self, summary: RunSummary) -> StorageResult<()> {
        self.emit_finished(&summary);
        self.ledger.cancel_run(&self.run_id, summary).await
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn emit_finished(&self, summary: &RunSummary) {
        obs::emit_run_finished(
            &self.run_id.to_string(),
            summary.duration_ms,
            summary.jobs_succeeded,
            summary.jobs_not_succeeded,
            summary.success,
        );
    }
}
