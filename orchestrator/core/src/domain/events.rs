// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::flow::{FlowStatus, SessionId};

/// Flow lifecycle events published by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlowEvent {
    FlowStarted {
        session_id: SessionId,
        flow_name: String,
        parent: Option<SessionId>,
        started_at: DateTime<Utc>,
    },
    StateExecuted {
        session_id: SessionId,
        state: String,
        executed_at: DateTime<Utc>,
    },
    FlowErrored {
        session_id: SessionId,
        error: String,
        errored_at: DateTime<Utc>,
    },
    FlowTerminated {
        session_id: SessionId,
        terminated_at: DateTime<Utc>,
    },
    /// Notifications for a flow were found but another worker holds its
    /// task lease.
    LeaseSkipped {
        session_id: SessionId,
        skipped_at: DateTime<Utc>,
    },
    /// Notifications arrived for a flow that is no longer running.
    InactiveFlowNotified {
        session_id: SessionId,
        status: FlowStatus,
        notified_at: DateTime<Utc>,
    },
    SnapshotFailed {
        session_id: SessionId,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl FlowEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            FlowEvent::FlowStarted { session_id, .. }
            | FlowEvent::StateExecuted { session_id, .. }
            | FlowEvent::FlowErrored { session_id, .. }
            | FlowEvent::FlowTerminated { session_id, .. }
            | FlowEvent::LeaseSkipped { session_id, .. }
            | FlowEvent::InactiveFlowNotified { session_id, .. }
            | FlowEvent::SnapshotFailed { session_id, .. } => session_id,
        }
    }
}

/// Queue-level events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A record crossed the poison warning threshold.
    RecordPoisoned {
        collection: String,
        key: String,
        claim_count: u32,
        parked: bool,
    },
}
