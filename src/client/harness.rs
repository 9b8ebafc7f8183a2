//! Runs a batch of workers concurrently and records every outcome.

use super::probe::{ProcessProbe, ProcessSample};
use super::worker::{self, WorkerOptions, WorkerResult};
use crate::sink::{ResultRecord, ResultSink, SinkError, Status};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// Everything needed to run one batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Server address, `host:port`.
    pub target: String,
    /// Messages each worker sends. Non-positive values abort the batch.
    pub messages: i64,
    /// Workers launched by this batch.
    pub workers: usize,
    /// Client id of the first worker.
    pub start_index: u64,
    pub scenario_id: String,
    pub repetition: u32,
    /// Total clients across every process in the scenario. Descriptive only.
    pub declared_clients: usize,
    /// Servers behind the target. Descriptive only.
    pub declared_servers: usize,
    pub worker: WorkerOptions,
}

/// Launches workers and turns their results into records.
#[derive(Clone)]
pub struct Harness {
    config: Arc<BatchConfig>,
    probe: Arc<ProcessProbe>,
}

impl Harness {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: Arc::new(config),
            probe: Arc::new(ProcessProbe::new()),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run every worker and wait for all of them.
    ///
    /// Returns one record per worker, ordered by client id, or a single
    /// `param_error` record if the batch is misconfigured.
    pub async fn run_batch(&self) -> Vec<ResultRecord> {
        let config = Arc::clone(&self.config);
        self.run_workers(move |client_id, messages| {
            let config = Arc::clone(&config);
            async move { worker::run(&config.target, messages, client_id, &config.worker).await }
        })
        .await
    }

    /// Spawn one task per client id running `work(client_id, messages)`.
    async fn run_workers<F, Fut>(&self, work: F) -> Vec<ResultRecord>
    where
        F: Fn(u64, u64) -> Fut,
        Fut: Future<Output = WorkerResult> + Send + 'static,
    {
        let config = &self.config;
        let messages = match u64::try_from(config.messages) {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(messages = config.messages, "Messages per worker must be positive");
                return vec![self.synthetic_record(
                    Status::ParamError,
                    format!("invalid number of messages: {}", config.messages),
                )];
            }
        };

        info!(
            target_addr = %config.target,
            workers = config.workers,
            messages,
            scenario = %config.scenario_id,
            repetition = config.repetition,
            protocol = %config.worker.protocol,
            pacing = ?config.worker.pacing,
            "Starting batch"
        );
        let started = Instant::now();

        let handles: Vec<_> = (0..config.workers)
            .map(|slot| {
                let client_id = config.start_index + slot as u64;
                let gauge = self.probe.enter();
                let probe = Arc::clone(&self.probe);
                let run = work(client_id, messages);

                tokio::spawn(async move {
                    let _gauge = gauge;
                    let sample = probe.sample();
                    (run.await, sample)
                })
            })
            .collect();

        // Slot i belongs to client start_index + i and is written once.
        let mut slots: Vec<Option<ResultRecord>> = vec![None; config.workers];
        for (slot, handle) in handles.into_iter().enumerate() {
            let record = match handle.await {
                Ok((result, sample)) => self.record(result, sample),
                Err(e) => {
                    let client_id = config.start_index + slot as u64;
                    let detail = panic_message(e);
                    error!(client_id, error = %detail, "Worker task failed");
                    self.panic_record(client_id, detail)
                }
            };
            slots[slot] = Some(record);
        }

        let records: Vec<ResultRecord> = slots.into_iter().flatten().collect();
        let succeeded = records
            .iter()
            .filter(|r| r.status == Status::Success)
            .count();
        info!(
            workers = records.len(),
            succeeded,
            failed = records.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch complete"
        );

        records
    }

    /// Run the batch and persist its records to `sink`.
    ///
    /// The batch runs in its own task; if that task dies, a single `panic`
    /// record is written in place of the batch results.
    pub async fn execute(&self, sink: ResultSink) -> Vec<ResultRecord> {
        let harness = self.clone();
        self.persist(sink, async move { harness.run_batch().await })
            .await
    }

    async fn persist<B>(&self, sink: ResultSink, batch: B) -> Vec<ResultRecord>
    where
        B: Future<Output = Vec<ResultRecord>> + Send + 'static,
    {
        let header_sink = sink.clone();
        if let Err(e) = blocking(move || header_sink.ensure_header().map(|_| ())).await {
            warn!(error = %e, "Could not ensure result header");
        }

        let records = match tokio::spawn(batch).await {
            Ok(records) => records,
            Err(e) => {
                let detail = panic_message(e);
                error!(error = %detail, "Batch aborted");
                vec![self.synthetic_record(Status::Panic, detail)]
            }
        };

        let rows = records.clone();
        let path = sink.path().display().to_string();
        match blocking(move || sink.append(&rows)).await {
            Ok(()) => info!(path = %path, records = records.len(), "Results written"),
            Err(e) => error!(path = %path, error = %e, "Failed to write results"),
        }

        records
    }

    fn record(&self, result: WorkerResult, sample: ProcessSample) -> ResultRecord {
        let config = &self.config;
        ResultRecord {
            scenario_id: config.scenario_id.clone(),
            repetition: config.repetition,
            client_id: result.client_id,
            num_clients_total: config.declared_clients,
            num_servers: config.declared_servers,
            num_messages: config.messages,
            t_start: result.t_start,
            t_end: result.t_end,
            total_elapsed_ms: result.total_elapsed_ms,
            status: result.status,
            error_detail: result.error_detail,
            mem_mb: sample.mem_mb,
            live_worker_count: sample.live_workers,
        }
    }

    fn panic_record(&self, client_id: u64, detail: String) -> ResultRecord {
        let now = Utc::now();
        self.record(
            WorkerResult {
                client_id,
                t_start: now,
                t_end: now,
                total_elapsed_ms: 0.0,
                status: Status::Panic,
                error_detail: detail,
            },
            self.probe.sample(),
        )
    }

    /// A record that stands in for the whole batch.
    fn synthetic_record(&self, status: Status, detail: String) -> ResultRecord {
        let mut record = self.panic_record(self.config.start_index, detail);
        record.status = status;
        record
    }
}

/// Run blocking sink I/O off the async worker threads.
async fn blocking<F>(f: F) -> Result<(), SinkError>
where
    F: FnOnce() -> Result<(), SinkError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(SinkError::Task(panic_message(e))),
    }
}

/// Best-effort description of why a task ended abnormally.
fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }

    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic: unknown payload".to_string()
    }
}
