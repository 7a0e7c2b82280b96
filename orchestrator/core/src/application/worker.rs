// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Flow Worker - executes flows whose responses have arrived
//!
//! Each cycle walks one pass of:
//!
//! ```text
//! IDLE → DISCOVER → LEASE → EXECUTE → PERSIST → RELEASE → IDLE
//! ```
//!
//! - **DISCOVER** claims wake-ups from `notifications/<queue>` and groups
//!   them by session.
//! - **LEASE** claims the session's task record. Losing that claim means
//!   another worker is executing the flow; the wake-ups are released so the
//!   holder's next cycle sees them.
//! - **EXECUTE** runs the flow's ready states through the [`FlowRunner`].
//! - **PERSIST** writes outbound calls, child flows and the new snapshot,
//!   or deletes the flow once it terminated.
//! - **RELEASE** drops the task lease and the consumed wake-ups.
//!
//! Up to `parallelism` sessions run concurrently. Workers in other
//! processes coordinate only through the lease compare-and-set.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Competing-consumer execution of flows

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::flow_runner::{Execution, FlowRunner};
use crate::application::flow_store::{ChildLaunch, FlowStore};
use crate::application::lease_queue::{LeaseQueue, QueueError};
use crate::domain::config::WorkerConfig;
use crate::domain::events::FlowEvent;
use crate::domain::flow::{FlowSnapshot, FlowStatus, ParentLink, SessionId};
use crate::domain::lease::{ClaimOptions, RecordId};
use crate::domain::record::RecordKey;
use crate::domain::responses::{ResponseMessage, Status};
use crate::infrastructure::event_bus::EventBus;

/// What one worker cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub notifications_claimed: usize,
    pub sessions_processed: usize,
    /// Sessions whose task lease was held by someone else.
    pub sessions_skipped: usize,
    /// Sessions whose flow had already left RUNNING or was deleted.
    pub sessions_inactive: usize,
    pub states_executed: usize,
    pub flows_terminated: usize,
    pub flows_errored: usize,
    /// Sessions that could not be processed, with the reason.
    pub failures: Vec<(SessionId, String)>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.notifications_claimed == 0
    }

    fn absorb(&mut self, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Executed {
                states,
                terminated,
                errored,
            } => {
                self.sessions_processed += 1;
                self.states_executed += states;
                self.flows_terminated += usize::from(terminated);
                self.flows_errored += usize::from(errored);
            }
            SessionOutcome::Skipped => self.sessions_skipped += 1,
            SessionOutcome::Inactive => self.sessions_inactive += 1,
            SessionOutcome::Failed(session_id, reason) => self.failures.push((session_id, reason)),
        }
    }
}

#[derive(Debug)]
enum SessionOutcome {
    Executed {
        states: usize,
        terminated: bool,
        errored: bool,
    },
    Skipped,
    Inactive,
    Failed(SessionId, String),
}

pub struct FlowWorker {
    worker_id: String,
    flows: FlowStore,
    runner: FlowRunner,
    config: WorkerConfig,
    event_bus: EventBus,
    shutdown_token: CancellationToken,
}

impl FlowWorker {
    pub fn new(flows: FlowStore, runner: FlowRunner, config: WorkerConfig, event_bus: EventBus) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
        Self {
            worker_id,
            flows,
            runner,
            config,
            event_bus,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn flows(&self) -> &FlowStore {
        &self.flows
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Worker loop; returns once the shutdown token fires. In-flight
    /// sessions of the current cycle are finished first.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Flow worker is disabled");
            return;
        }

        info!(
            worker_id = %self.worker_id,
            queues = ?self.config.queues,
            parallelism = self.config.parallelism,
            "Starting flow worker"
        );

        let mut tick = interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.run_once().await {
                        Ok(report) if !report.is_idle() => {
                            info!(
                                worker_id = %self.worker_id,
                                sessions = report.sessions_processed,
                                states = report.states_executed,
                                skipped = report.sessions_skipped,
                                failures = report.failures.len(),
                                "Flow worker cycle completed"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(worker_id = %self.worker_id, "Flow worker cycle failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!(worker_id = %self.worker_id, "Shutdown signal received, stopping flow worker");
                    break;
                }
            }
        }

        info!(worker_id = %self.worker_id, "Flow worker stopped");
    }

    /// Create and persist a top-level flow on `queue`.
    pub async fn start_flow(&self, queue: &str, flow_name: &str, args: Value) -> Result<SessionId> {
        let session_id = SessionId::new(queue);
        self.launch(Launch::Root {
            session_id: session_id.clone(),
            flow_name: flow_name.to_string(),
            args,
        })
        .await?;
        Ok(session_id)
    }

    /// One DISCOVER..RELEASE pass over every configured queue.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut sessions: Vec<(LeaseQueue, SessionId, Vec<RecordId>)> = Vec::new();

        for queue_name in &self.config.queues {
            let queue = self.flows.notifications(queue_name);
            let claimed = queue
                .claim_records(
                    ClaimOptions::default()
                        .with_limit(self.config.notification_batch)
                        .with_lease(self.config.notification_lease),
                )
                .await?;
            report.notifications_claimed += claimed.len();

            let mut by_session: BTreeMap<SessionId, Vec<RecordId>> = BTreeMap::new();
            let mut garbage = Vec::new();
            for record in claimed {
                match std::str::from_utf8(&record.value)
                    .ok()
                    .and_then(|s| s.parse::<SessionId>().ok())
                {
                    Some(session_id) => by_session.entry(session_id).or_default().push(record.id),
                    None => {
                        warn!(queue = %queue_name, key = %record.id, "Dropping malformed notification");
                        garbage.push(record.id);
                    }
                }
            }
            if !garbage.is_empty() {
                ignore_lock_errors(queue.delete_records(&garbage).await)?;
            }
            sessions.extend(
                by_session
                    .into_iter()
                    .map(|(session_id, ids)| (queue.clone(), session_id, ids)),
            );
        }

        let outcomes: Vec<SessionOutcome> = stream::iter(sessions)
            .map(|(queue, session_id, ids)| self.process_session(queue, session_id, ids))
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.absorb(outcome);
        }

        metrics::counter!("aegis_fleet_worker_cycles_total").increment(1);
        Ok(report)
    }

    async fn process_session(&self, notifications: LeaseQueue, session_id: SessionId, ids: Vec<RecordId>) -> SessionOutcome {
        match self.execute_session(&notifications, &session_id, &ids).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    worker_id = %self.worker_id,
                    session_id = %session_id,
                    "Failed to process session: {:#}",
                    e
                );
                SessionOutcome::Failed(session_id, format!("{:#}", e))
            }
        }
    }

    async fn execute_session(
        &self,
        notifications: &LeaseQueue,
        session_id: &SessionId,
        ids: &[RecordId],
    ) -> Result<SessionOutcome> {
        // LEASE
        let task_queue = self.flows.task_queue(session_id);
        let claimed = task_queue
            .claim_records(
                ClaimOptions::default()
                    .with_limit(1)
                    .with_lease(self.config.flow_lease),
            )
            .await?;
        let Some(task) = claimed.into_iter().next() else {
            if task_queue.log().is_empty().await? {
                debug!(session_id = %session_id, "Notified flow no longer exists");
                ignore_lock_errors(notifications.delete_records(ids).await)?;
                return Ok(SessionOutcome::Inactive);
            }
            debug!(session_id = %session_id, "Flow is leased by another worker");
            ignore_lock_errors(notifications.release_records(ids).await)?;
            metrics::counter!("aegis_fleet_worker_lease_skips_total").increment(1);
            self.event_bus.publish_flow_event(FlowEvent::LeaseSkipped {
                session_id: session_id.clone(),
                skipped_at: Utc::now(),
            });
            return Ok(SessionOutcome::Skipped);
        };

        // EXECUTE
        let snapshot = match FlowSnapshot::from_bytes(&task.value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return self
                    .abandon(notifications, &task_queue, session_id, &task.id, ids, e.to_string())
                    .await;
            }
        };
        if snapshot.context.status != FlowStatus::Running {
            let status = snapshot.context.status;
            debug!(session_id = %session_id, status = %status, "Ignoring notification for inactive flow");
            ignore_lock_errors(task_queue.release_records(&[task.id]).await)?;
            ignore_lock_errors(notifications.delete_records(ids).await)?;
            self.event_bus.publish_flow_event(FlowEvent::InactiveFlowNotified {
                session_id: session_id.clone(),
                status,
                notified_at: Utc::now(),
            });
            return Ok(SessionOutcome::Inactive);
        }

        let (responses, garbage) = self.flows.read_responses(session_id).await?;
        let execution: Execution<RecordKey> = match self.runner.execute(snapshot, responses) {
            Ok(execution) => execution,
            Err(e) => {
                return self
                    .abandon(notifications, &task_queue, session_id, &task.id, ids, e.to_string())
                    .await;
            }
        };

        // PERSIST
        let Execution {
            snapshot,
            outbound,
            executed_states,
            mut consumed,
            error,
        } = execution;
        let status = snapshot.context.status;

        // Nothing leaves this worker unless the lease survived execution.
        let task_id = match task_queue.refresh_claims(&[task.id], self.config.flow_lease).await {
            Ok(mut refreshed) => refreshed.pop().unwrap_or(task.id),
            Err(e) => return self.lease_lost(notifications, session_id, ids, e).await,
        };

        let children = self.flows.write_outbound(session_id, outbound).await?;
        for child in children {
            self.launch(Launch::Child(child)).await?;
        }
        consumed.extend(garbage);

        // RELEASE
        match status {
            FlowStatus::Terminated => {
                if let Err(e) = task_queue.verify(&task_id).await {
                    return self.lease_lost(notifications, session_id, ids, e).await;
                }
                self.flows.delete_flow(session_id).await?;
            }
            FlowStatus::Running | FlowStatus::Error => {
                let bytes = snapshot.to_bytes()?;
                if let Err(e) = task_queue.replace_record(&task_id, bytes).await {
                    return self.lease_lost(notifications, session_id, ids, e).await;
                }
                // Responses go only once the snapshot that absorbed them is stored.
                self.flows.delete_responses(session_id, &consumed).await?;
                ignore_lock_errors(task_queue.release_records(&[task_id]).await)?;
            }
        }

        for state in &executed_states {
            self.event_bus.publish_flow_event(FlowEvent::StateExecuted {
                session_id: session_id.clone(),
                state: state.clone(),
                executed_at: Utc::now(),
            });
        }
        match (status, &error) {
            (FlowStatus::Terminated, _) => {
                info!(session_id = %session_id, "Flow terminated");
                self.event_bus.publish_flow_event(FlowEvent::FlowTerminated {
                    session_id: session_id.clone(),
                    terminated_at: Utc::now(),
                });
            }
            (_, Some(e)) => {
                self.event_bus.publish_flow_event(FlowEvent::FlowErrored {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                    errored_at: Utc::now(),
                });
            }
            _ => {}
        }
        ignore_lock_errors(notifications.delete_records(ids).await)?;

        Ok(SessionOutcome::Executed {
            states: executed_states.len(),
            terminated: status == FlowStatus::Terminated,
            errored: status == FlowStatus::Error,
        })
    }

    /// The flow lease expired or was taken over while executing. The stored
    /// snapshot and its responses stay as they were and the wake-ups go back
    /// to the queue, so the next holder runs the same states again.
    async fn lease_lost(
        &self,
        notifications: &LeaseQueue,
        session_id: &SessionId,
        ids: &[RecordId],
        e: QueueError,
    ) -> Result<SessionOutcome> {
        if !e.is_lock() {
            return Err(e.into());
        }
        warn!(session_id = %session_id, "Lost flow lease before persisting: {}", e);
        metrics::counter!("aegis_fleet_worker_lease_losses_total").increment(1);
        ignore_lock_errors(notifications.release_records(ids).await)?;
        Ok(SessionOutcome::Failed(session_id.clone(), e.to_string()))
    }

    /// Give up on a flow whose snapshot cannot be used: keep its records for
    /// inspection, drop the wake-ups and report the failure.
    async fn abandon(
        &self,
        notifications: &LeaseQueue,
        task_queue: &LeaseQueue,
        session_id: &SessionId,
        task: &RecordId,
        ids: &[RecordId],
        reason: String,
    ) -> Result<SessionOutcome> {
        error!(session_id = %session_id, "Flow snapshot unusable: {}", reason);
        metrics::counter!("aegis_fleet_worker_snapshot_failures_total").increment(1);
        self.event_bus.publish_flow_event(FlowEvent::SnapshotFailed {
            session_id: session_id.clone(),
            error: reason.clone(),
            failed_at: Utc::now(),
        });
        ignore_lock_errors(task_queue.release_records(&[*task]).await)?;
        ignore_lock_errors(notifications.delete_records(ids).await)?;
        Ok(SessionOutcome::Failed(session_id.clone(), reason))
    }

    /// Create a flow (and any children its `start` asks for).
    async fn launch(&self, first: Launch) -> Result<()> {
        let mut todo = vec![first];
        while let Some(next) = todo.pop() {
            let (session_id, flow_name, args, parent) = match next {
                Launch::Root {
                    session_id,
                    flow_name,
                    args,
                } => (session_id, flow_name, args, None),
                Launch::Child(ChildLaunch {
                    session_id,
                    flow_name,
                    args,
                    parent,
                }) => (session_id, flow_name, args, Some(parent)),
            };

            let execution: Execution<RecordKey> =
                match self
                    .runner
                    .start_flow(session_id.clone(), &flow_name, args, parent.clone())
                {
                    Ok(execution) => execution,
                    Err(e) => match parent {
                        // Unknown child flows fail the parent's request
                        // instead of the parent's handler.
                        Some(parent) => {
                            warn!(session_id = %session_id, "Cannot start child flow: {}", e);
                            self.fail_parent(parent, e.to_string()).await?;
                            continue;
                        }
                        None => return Err(e.into()),
                    },
                };

            let Execution {
                snapshot, outbound, ..
            } = execution;
            let status = snapshot.context.status;
            if status != FlowStatus::Terminated {
                self.flows.create_task(&snapshot).await?;
            }
            let children = self.flows.write_outbound(&session_id, outbound).await?;
            todo.extend(children.into_iter().map(Launch::Child));

            info!(session_id = %session_id, flow_name = %flow_name, status = %status, "Started flow");
            self.event_bus.publish_flow_event(FlowEvent::FlowStarted {
                session_id,
                flow_name,
                parent: parent.map(|p| p.session_id),
                started_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn fail_parent(&self, parent: ParentLink, reason: String) -> Result<(), QueueError> {
        let message = ResponseMessage::status(parent.session_id.clone(), parent.request_id, 0, Status::error(reason));
        self.flows
            .append_responses(&parent.session_id, &[message], true)
            .await
    }
}

enum Launch {
    Root {
        session_id: SessionId,
        flow_name: String,
        args: Value,
    },
    Child(ChildLaunch),
}

/// Treat a lost lease as done: someone else owns the record now.
fn ignore_lock_errors(result: Result<(), QueueError>) -> Result<(), QueueError> {
    match result {
        Err(QueueError::Lock(e)) => {
            debug!("Ignoring lost lease: {}", e);
            Ok(())
        }
        other => other,
    }
}
