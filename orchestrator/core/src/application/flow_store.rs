// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Flow Store
//!
//! Where flows, their inbound responses and the work they hand out live in
//! the shared store:
//!
//! ```text
//! <session_id>/Records               task record: the flow snapshot
//! <session_id>/responses/Records     inbound ResponseMessages
//! notifications/<queue>/Records      wake-ups, payload = session id
//! <client_id>/tasks/Records          ClientTasks for an agent
//! ```
//!
//! All four are plain append logs; the task record, notifications and
//! client tasks are consumed through [`LeaseQueue`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::application::append_log::{AppendLog, ScanOptions};
use crate::application::lease_queue::{LeaseQueue, QueueError};
use crate::domain::clock::Clock;
use crate::domain::config::QueueConfig;
use crate::domain::flow::{
    client_task_collection, notification_collection, FlowSnapshot, OutboundCall, ParentLink, SessionId,
};
use crate::domain::record::{CollectionId, RecordKey};
use crate::domain::responses::{ResponseMessage, Status};
use crate::domain::store::{Store, StoreError};
use crate::infrastructure::event_bus::EventBus;

/// A child flow some handler asked for, still to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildLaunch {
    pub session_id: SessionId,
    pub flow_name: String,
    pub args: serde_json::Value,
    pub parent: ParentLink,
}

#[derive(Clone)]
pub struct FlowStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    queue_config: QueueConfig,
    event_bus: Option<EventBus>,
}

impl FlowStore {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, queue_config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            queue_config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn log(&self, id: CollectionId) -> AppendLog {
        AppendLog::new(id, self.store.clone(), self.clock.clone())
    }

    pub fn queue(&self, id: CollectionId) -> LeaseQueue {
        let queue = LeaseQueue::new(self.log(id), self.queue_config.clone());
        match &self.event_bus {
            Some(bus) => queue.with_event_bus(bus.clone()),
            None => queue,
        }
    }

    pub fn task_queue(&self, session_id: &SessionId) -> LeaseQueue {
        self.queue(session_id.task_collection())
    }

    pub fn responses_log(&self, session_id: &SessionId) -> AppendLog {
        self.log(session_id.responses_collection())
    }

    pub fn notifications(&self, queue: &str) -> LeaseQueue {
        self.queue(notification_collection(queue))
    }

    pub fn client_tasks(&self, client_id: &str) -> LeaseQueue {
        self.queue(client_task_collection(client_id))
    }

    /// Write a new flow's task record.
    pub async fn create_task(&self, snapshot: &FlowSnapshot) -> Result<RecordKey, QueueError> {
        let bytes = snapshot
            .to_bytes()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.task_queue(&snapshot.context.session_id).add(bytes).await
    }

    /// Current snapshot of a flow, read without taking its lease.
    pub async fn load_snapshot(&self, session_id: &SessionId) -> Result<Option<(RecordKey, FlowSnapshot)>, StoreError> {
        let log = self.task_queue(session_id).log().clone();
        let mut records = log.scan(ScanOptions::default().with_max_records(1));
        let Some((key, value)) = records.try_next().await? else {
            return Ok(None);
        };
        let snapshot = FlowSnapshot::from_bytes(&value).map_err(|e| StoreError::Corrupt {
            subject: log.subject().to_string(),
            column: key.column(),
            reason: e.to_string(),
        })?;
        Ok(Some((key, snapshot)))
    }

    /// Wake up whichever worker watches `session_id`'s queue.
    pub async fn notify(&self, session_id: &SessionId) -> Result<RecordKey, QueueError> {
        let key = self
            .notifications(session_id.queue())
            .add(Bytes::from(session_id.to_string()))
            .await?;
        metrics::counter!("aegis_fleet_notifications_total").increment(1);
        Ok(key)
    }

    /// Append responses for one session, optionally followed by a wake-up.
    pub async fn append_responses(
        &self,
        session_id: &SessionId,
        messages: &[ResponseMessage],
        notify: bool,
    ) -> Result<(), QueueError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut values = Vec::with_capacity(messages.len());
        for message in messages {
            let bytes = serde_json::to_vec(message).map_err(StoreError::from)?;
            values.push(Bytes::from(bytes));
        }
        self.responses_log(session_id).add_many(values).await?;
        if notify {
            self.notify(session_id).await?;
        }
        Ok(())
    }

    /// Every stored response of a session. Records that do not decode are
    /// returned separately so they can be removed.
    pub async fn read_responses(
        &self,
        session_id: &SessionId,
    ) -> Result<(Vec<(RecordKey, ResponseMessage)>, Vec<RecordKey>), StoreError> {
        let records = self.responses_log(session_id).read_all().await?;
        let mut messages = Vec::with_capacity(records.len());
        let mut garbage = Vec::new();
        for (key, value) in records {
            match serde_json::from_slice::<ResponseMessage>(&value) {
                Ok(message) if &message.session_id == session_id => messages.push((key, message)),
                Ok(message) => {
                    warn!(
                        session_id = %session_id,
                        addressed_to = %message.session_id,
                        "Dropping response filed under the wrong session"
                    );
                    garbage.push(key);
                }
                Err(e) => {
                    warn!(session_id = %session_id, key = %key, "Dropping undecodable response: {}", e);
                    garbage.push(key);
                }
            }
        }
        Ok((messages, garbage))
    }

    pub async fn delete_responses(&self, session_id: &SessionId, keys: &[RecordKey]) -> Result<(), StoreError> {
        self.responses_log(session_id).delete_records(keys).await
    }

    /// Remove a flow's task log and responses.
    pub async fn delete_flow(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.task_queue(session_id).log().delete().await?;
        self.responses_log(session_id).delete().await?;
        debug!(session_id = %session_id, "Deleted flow records");
        Ok(())
    }

    /// Write the outbound calls of `session_id`. Child flows need a runner
    /// and are handed back to the caller instead.
    pub async fn write_outbound(
        &self,
        session_id: &SessionId,
        calls: Vec<OutboundCall>,
    ) -> Result<Vec<ChildLaunch>, QueueError> {
        let mut children = Vec::new();
        // Per session: messages plus whether a wake-up is due.
        let mut responses: BTreeMap<SessionId, (Vec<ResponseMessage>, bool)> = BTreeMap::new();

        for call in calls {
            match call {
                OutboundCall::ClientTask { client_id, task } => {
                    let bytes = serde_json::to_vec(&task).map_err(StoreError::from)?;
                    self.client_tasks(&client_id).add(Bytes::from(bytes)).await?;
                    metrics::counter!("aegis_fleet_client_tasks_total").increment(1);
                }
                OutboundCall::StartFlow {
                    session_id: child,
                    flow_name,
                    args,
                    parent,
                } => children.push(ChildLaunch {
                    session_id: child,
                    flow_name,
                    args,
                    parent,
                }),
                OutboundCall::StateResponse { request_id, payload } => {
                    let entry = responses.entry(session_id.clone()).or_default();
                    entry.0.push(ResponseMessage::message(session_id.clone(), request_id, 0, payload));
                    entry.0.push(ResponseMessage::status(session_id.clone(), request_id, 1, Status::Ok));
                    entry.1 = true;
                }
                OutboundCall::ParentReply {
                    parent,
                    response_id,
                    payload,
                } => {
                    let entry = responses.entry(parent.session_id.clone()).or_default();
                    entry.0.push(ResponseMessage::message(
                        parent.session_id,
                        parent.request_id,
                        response_id.0,
                        payload,
                    ));
                }
                OutboundCall::ParentStatus {
                    parent,
                    response_id,
                    status,
                } => {
                    let entry = responses.entry(parent.session_id.clone()).or_default();
                    entry.0.push(ResponseMessage::status(
                        parent.session_id,
                        parent.request_id,
                        response_id.0,
                        status,
                    ));
                    entry.1 = true;
                }
            }
        }

        for (target, (messages, notify)) in responses {
            self.append_responses(&target, &messages, notify).await?;
        }
        Ok(children)
    }
}
