//! Worker launch history kept from the control API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use gridscale_core::{WorkerRecord, WorkerRecorder};
use gridscale_pipeline::PipelineApi;

use crate::worker::host_name;

/// Records kept before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 100;

/// Ring buffer of finished launches, filled from the run's final state.
pub struct CloudPipelineWorkerRecorder {
    api: Arc<dyn PipelineApi>,
    records: Mutex<VecDeque<WorkerRecord>>,
    capacity: usize,
}

impl CloudPipelineWorkerRecorder {
    pub fn new(api: Arc<dyn PipelineApi>) -> Self {
        Self {
            api,
            records: Mutex::new(VecDeque::with_capacity(DEFAULT_CAPACITY)),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl WorkerRecorder for CloudPipelineWorkerRecorder {
    async fn record(&self, run_id: &str) {
        let run = match self.api.load_run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(%run_id, error = %e, "worker launch not recorded");
                return;
            }
        };
        let record = WorkerRecord {
            run_id: run_id.to_string(),
            host_name: host_name(run_id),
            instance_type: run.instance.node_type.clone().unwrap_or_default(),
            started_at: run.started_at(),
            stopped_at: run.stopped_at(),
            had_capacity_failure: run.had_capacity_failure(),
        };
        debug!(
            %run_id,
            instance_type = %record.instance_type,
            capacity_failure = record.had_capacity_failure,
            "worker launch recorded"
        );
        let Ok(mut records) = self.records.lock() else {
            warn!(%run_id, "worker records lock poisoned");
            return;
        };
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn records(&self) -> Vec<WorkerRecord> {
        self.records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_pipeline::testing::{run_with_status, FakePipelineApi};
    use gridscale_pipeline::{RunInstance, RunStatus};

    #[tokio::test]
    async fn records_final_run_state() {
        let api = Arc::new(FakePipelineApi::new());
        let mut run = run_with_status(RunStatus::Failure);
        run.instance = RunInstance {
            node_type: Some("m5.xlarge".to_string()),
            node_name: None,
        };
        run.start_date = Some("2024-01-18 11:00:00.000".to_string());
        run.state_reason_message = Some("Insufficient instance capacity".to_string());
        api.push_run("7", run);
        let recorder = CloudPipelineWorkerRecorder::new(api);

        recorder.record("7").await;
        let records = recorder.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host_name, "pipeline-7");
        assert_eq!(records[0].instance_type, "m5.xlarge");
        assert!(records[0].had_capacity_failure);
        assert!(records[0].started_at.is_some());
        assert!(records[0].stopped_at.is_none());
    }

    #[tokio::test]
    async fn api_failure_skips_record() {
        let recorder = CloudPipelineWorkerRecorder::new(Arc::new(FakePipelineApi::new()));
        recorder.record("7").await;
        assert!(recorder.records().is_empty());
    }

    #[tokio::test]
    async fn oldest_records_are_dropped() {
        let api = Arc::new(FakePipelineApi::new());
        for id in ["1", "2", "3"] {
            api.push_run(id, run_with_status(RunStatus::Stopped));
        }
        let recorder = CloudPipelineWorkerRecorder::new(api).with_capacity(2);
        for id in ["1", "2", "3"] {
            recorder.record(id).await;
        }
        let ids: Vec<String> = recorder.records().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, ["2", "3"]);
    }
}
