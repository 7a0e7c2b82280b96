// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Inbound side of client calls.
//!
//! The transport layer hands over already-authenticated response tuples;
//! [`ResponseInbox`] files them under their session and wakes the flow up.
//! [`ClientTaskQueue`] is what an agent uses to pick up the requests flows
//! addressed to it and to answer them.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::flow_store::FlowStore;
use crate::application::lease_queue::{LeaseQueue, QueueError};
use crate::domain::flow::{ClientTask, SessionId};
use crate::domain::lease::{ClaimOptions, RecordId};
use crate::domain::responses::{ResponseMessage, Status};

#[derive(Clone)]
pub struct ResponseInbox {
    flows: FlowStore,
}

impl ResponseInbox {
    pub fn new(flows: FlowStore) -> Self {
        Self { flows }
    }

    /// File `messages` under their sessions. One wake-up is written per
    /// session that received a status message. Returns the number of
    /// sessions touched.
    pub async fn deliver(&self, messages: Vec<ResponseMessage>) -> Result<usize, QueueError> {
        let mut by_session: BTreeMap<SessionId, Vec<ResponseMessage>> = BTreeMap::new();
        for message in messages {
            by_session.entry(message.session_id.clone()).or_default().push(message);
        }

        let sessions = by_session.len();
        for (session_id, messages) in by_session {
            let notify = messages.iter().any(ResponseMessage::is_status);
            let count = messages.len();
            self.flows.append_responses(&session_id, &messages, notify).await?;
            metrics::counter!("aegis_fleet_responses_delivered_total").increment(count as u64);
            debug!(session_id = %session_id, count, notify, "Delivered responses");
        }
        Ok(sessions)
    }
}

/// A claimed request for an agent.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: RecordId,
    pub task: ClientTask,
}

/// An agent's view of `<client_id>/tasks`.
#[derive(Clone)]
pub struct ClientTaskQueue {
    client_id: String,
    queue: LeaseQueue,
    inbox: ResponseInbox,
}

impl ClientTaskQueue {
    pub fn new(flows: FlowStore, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            queue: flows.client_tasks(&client_id),
            inbox: ResponseInbox::new(flows),
            client_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Claim up to `limit` requests. Records that do not decode are removed.
    pub async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<ClaimedTask>, QueueError> {
        let claimed = self
            .queue
            .claim_records(ClaimOptions::default().with_limit(limit).with_lease(lease))
            .await?;
        let mut tasks = Vec::with_capacity(claimed.len());
        let mut garbage = Vec::new();
        for record in claimed {
            match serde_json::from_slice::<ClientTask>(&record.value) {
                Ok(task) => tasks.push(ClaimedTask { id: record.id, task }),
                Err(e) => {
                    warn!(client_id = %self.client_id, key = %record.id, "Dropping undecodable client task: {}", e);
                    garbage.push(record.id);
                }
            }
        }
        if !garbage.is_empty() {
            self.queue.delete_records(&garbage).await?;
        }
        Ok(tasks)
    }

    /// Answer a claimed request with `payloads` followed by `status`, then
    /// remove it from the queue.
    pub async fn respond(&self, claimed: &ClaimedTask, payloads: Vec<Value>, status: Status) -> Result<(), QueueError> {
        self.queue.verify(&claimed.id).await?;
        let task = &claimed.task;
        let mut messages: Vec<ResponseMessage> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| ResponseMessage::message(task.session_id.clone(), task.request_id, i as u64, payload))
            .collect();
        let status_id = messages.len() as u64;
        messages.push(ResponseMessage::status(task.session_id.clone(), task.request_id, status_id, status));
        self.inbox.deliver(messages).await?;
        self.queue.delete_records(&[claimed.id]).await
    }

    /// Hand a claimed request back for another agent process.
    pub async fn release(&self, claimed: &ClaimedTask) -> Result<(), QueueError> {
        self.queue.release_records(&[claimed.id]).await
    }

    pub async fn pending(&self) -> Result<u64, QueueError> {
        Ok(self.queue.log().len().await?)
    }

    /// Enqueue a raw task; used by tools that bypass flows.
    pub async fn push(&self, task: &ClientTask) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(task).map_err(crate::domain::store::StoreError::from)?;
        self.queue.add(Bytes::from(bytes)).await?;
        Ok(())
    }
}
