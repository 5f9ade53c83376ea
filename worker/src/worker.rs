use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shared::control::{ControlMessage, JobError, JobMetrics, JobResult, JobSubmit};

use crate::arena::Arena;
use crate::cli::fnv1a_64;
use crate::error::WorkerError;
use crate::executor::ExecutorRegistry;
use crate::lifecycle::{JobGuard, WorkerStatus};
use crate::transport::{HostLink, TransportError};

/// The worker's single control loop: one thread of execution that polls
/// the transport with a bounded timeout, keeps the slot heartbeat fresh
/// once per iteration, and runs jobs strictly in arrival order. Without a
/// host link it degrades to heartbeat-only standalone mode.
pub struct Worker {
    slot_index: usize,
    poll_interval: Duration,
    arena: Arena,
    registry: ExecutorRegistry,
    link: Option<HostLink>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        slot_index: usize,
        poll_interval: Duration,
        arena: Arena,
        registry: ExecutorRegistry,
        link: Option<HostLink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { slot_index, poll_interval, arena, registry, link, shutdown }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub async fn run(&mut self) -> Result<(), WorkerError> {
        self.arena.set_status(self.slot_index, WorkerStatus::Idle)?;
        info!(
            slot = self.slot_index,
            standalone = self.link.is_none(),
            "entering dispatch loop"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.arena.update_heartbeat(self.slot_index)?;

            let Some(link) = self.link.as_mut() else {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            };

            let received = tokio::select! {
                received = link.recv(self.poll_interval) => received,
                _ = self.shutdown.cancelled() => continue,
            };

            match received {
                Ok(None) => {}
                Ok(Some(message)) => {
                    if let Err(err) = self.handle_message(message).await {
                        self.downgrade(err);
                    }
                }
                Err(TransportError::Malformed(reason)) => {
                    warn!(%reason, "dropping malformed message");
                }
                Err(err) => self.downgrade(err),
            }
        }

        if let Some(link) = self.link.as_mut() {
            link.close().await;
        }
        info!(slot = self.slot_index, "dispatch loop stopped");
        Ok(())
    }

    /// The host side is gone; keep the slot heartbeat alive without it.
    /// Reconnecting is the supervisor's call (it restarts the worker).
    fn downgrade(&mut self, err: TransportError) {
        warn!(%err, "host link down, continuing in standalone mode");
        self.link = None;
    }

    async fn handle_message(&mut self, message: ControlMessage) -> Result<(), TransportError> {
        match message {
            ControlMessage::Heartbeat(beat) => {
                if let Some(link) = self.link.as_mut() {
                    link.send(ControlMessage::Heartbeat(beat)).await?;
                }
                Ok(())
            }
            ControlMessage::JobSubmit(job) => self.run_job(job).await,
            ControlMessage::JobCancel(cancel) => {
                // Advisory only: the executing job is not preemptible.
                info!(job_id = %cancel.job_id, "ignoring advisory cancel");
                Ok(())
            }
            other => {
                warn!(?other, "unexpected control message");
                Ok(())
            }
        }
    }

    async fn run_job(&mut self, job: JobSubmit) -> Result<(), TransportError> {
        info!(job_id = %job.job_id, op = %job.op_type, "job received");

        let digest = fnv1a_64(job.job_id.as_bytes());
        let guard = JobGuard::begin(&self.arena, self.slot_index, digest);
        let dispatched =
            self.registry.dispatch(&job.op_type, &self.arena, &job.inputs, &job.params);

        let mut metrics = JobMetrics {
            duration_us: dispatched.duration.as_micros() as u64,
            peak_memory_bytes: dispatched.peak_memory_bytes,
            items_processed: None,
        };
        let result = match dispatched.outcome {
            Ok(output) => {
                guard.complete();
                metrics.items_processed = output.items_processed;
                info!(job_id = %job.job_id, duration_us = metrics.duration_us, "job completed");
                JobResult {
                    job_id: job.job_id,
                    success: true,
                    outputs: output.outputs,
                    error: None,
                    metrics,
                }
            }
            Err(err) => {
                guard.mark_error();
                error!(job_id = %job.job_id, %err, "job failed");
                JobResult {
                    job_id: job.job_id,
                    success: false,
                    outputs: HashMap::new(),
                    error: Some(JobError {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        trace: None,
                    }),
                    metrics,
                }
            }
        };

        let sent = match self.link.as_mut() {
            Some(link) => link.send(ControlMessage::JobResult(result)).await,
            None => Ok(()),
        };
        // The guard restores IDLE only after the result is on the wire.
        drop(guard);
        sent
    }
}
