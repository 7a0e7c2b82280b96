// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Flow Domain Model
//!
//! A flow is a resumable state machine. It runs one state handler at a time,
//! asks for asynchronous work through its [`FlowContext`] and is suspended
//! into a serialized [`FlowSnapshot`] until the answers arrive. Whichever
//! worker holds the lease on the flow's task record resumes it.
//!
//! ```text
//!         start()            handle("A")           handle("B")
//! RUNNING ───────► pending ─────────────► pending ───────────► TERMINATED
//!                     │                                 │
//!                     └─────── handler error ───────────┴──► ERROR
//! ```
//!
//! Handlers never await. Everything they want done is recorded as an
//! [`OutboundCall`] and written by the worker after the handler returns.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::domain::record::CollectionId;
use crate::domain::responses::{RequestId, ResponseId, Responses, Status};

/// Name of the pseudo-state a new flow is in while `start` runs.
pub const START_STATE: &str = "Start";

/// Entries kept in a flow's persisted log.
const MAX_LOG_ENTRIES: usize = 100;

/// `<queue>:<opaque id>`. The queue part names the notification queue
/// workers watch for this flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid session id '{0}': expected '<queue>:<id>'")]
pub struct InvalidSessionId(pub String);

impl SessionId {
    pub fn new(queue: &str) -> Self {
        Self(format!("{}:{}", queue, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn queue(&self) -> &str {
        self.0.split_once(':').map(|(q, _)| q).unwrap_or(&self.0)
    }

    /// Collection holding the flow's task record.
    pub fn task_collection(&self) -> CollectionId {
        CollectionId::new(self.0.clone())
    }

    pub fn responses_collection(&self) -> CollectionId {
        self.task_collection().child("responses")
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((queue, id)) if !queue.is_empty() && !id.is_empty() && !queue.contains('/') => {
                Ok(Self(s.to_string()))
            }
            _ => Err(InvalidSessionId(s.to_string())),
        }
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue workers claim wake-ups for `queue` from.
pub fn notification_collection(queue: &str) -> CollectionId {
    CollectionId::new(format!("notifications/{}", queue))
}

/// Queue an agent claims its requests from.
pub fn client_task_collection(client_id: &str) -> CollectionId {
    CollectionId::new(client_id).child("tasks")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Error,
    Terminated,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Running)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowStatus::Running => "RUNNING",
            FlowStatus::Error => "ERROR",
            FlowStatus::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Who answers a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallTarget {
    Client { client_id: String },
    Flow { session_id: SessionId, flow_name: String },
    State,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: RequestId,
    pub next_state: String,
    pub target: CallTarget,
}

/// Where a child flow reports back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub session_id: SessionId,
    pub request_id: RequestId,
}

/// A request addressed to an agent, as stored on its task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTask {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Work a handler asked for, written by the worker once it returns.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCall {
    ClientTask {
        client_id: String,
        task: ClientTask,
    },
    StartFlow {
        session_id: SessionId,
        flow_name: String,
        args: Value,
        parent: ParentLink,
    },
    StateResponse {
        request_id: RequestId,
        payload: Value,
    },
    ParentReply {
        parent: ParentLink,
        response_id: ResponseId,
        payload: Value,
    },
    /// Final status of a child flow, closing its parent's request.
    ParentStatus {
        parent: ParentLink,
        response_id: ResponseId,
        status: Status,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowLogEntry {
    pub at: DateTime<Utc>,
    pub state: String,
    pub message: String,
}

/// Runner-managed state of a flow, persisted alongside the flow object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowContext {
    pub session_id: SessionId,
    pub flow_name: String,
    pub status: FlowStatus,
    pub current_state: String,
    next_request_id: u64,
    pub pending_requests: BTreeMap<RequestId, PendingRequest>,
    pub next_states: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Messages already sent to the parent request.
    #[serde(default)]
    pub replies_sent: u64,
    #[serde(default)]
    pub log: Vec<FlowLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    outbound: Vec<OutboundCall>,
}

impl FlowContext {
    pub fn new(session_id: SessionId, flow_name: impl Into<String>, parent: Option<ParentLink>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            flow_name: flow_name.into(),
            status: FlowStatus::Running,
            current_state: START_STATE.to_string(),
            next_request_id: 1,
            pending_requests: BTreeMap::new(),
            next_states: BTreeSet::new(),
            parent,
            error: None,
            replies_sent: 0,
            log: Vec::new(),
            created_at: now,
            updated_at: now,
            outbound: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == FlowStatus::Running
    }

    /// Send `payload` to agent `client_id`; its answers resume `next_state`.
    pub fn call_client(&mut self, client_id: &str, payload: Value, next_state: &str) -> RequestId {
        let id = self.allocate(
            next_state,
            CallTarget::Client {
                client_id: client_id.to_string(),
            },
        );
        self.outbound.push(OutboundCall::ClientTask {
            client_id: client_id.to_string(),
            task: ClientTask {
                session_id: self.session_id.clone(),
                request_id: id,
                payload,
                created_at: Utc::now(),
            },
        });
        id
    }

    /// Start child flow `flow_name`; its replies and final status resume
    /// `next_state`. Returns the request id and the child's session id.
    pub fn call_flow(&mut self, flow_name: &str, args: Value, next_state: &str) -> (RequestId, SessionId) {
        let child = SessionId::new(self.session_id.queue());
        let id = self.allocate(
            next_state,
            CallTarget::Flow {
                session_id: child.clone(),
                flow_name: flow_name.to_string(),
            },
        );
        self.outbound.push(OutboundCall::StartFlow {
            session_id: child.clone(),
            flow_name: flow_name.to_string(),
            args,
            parent: ParentLink {
                session_id: self.session_id.clone(),
                request_id: id,
            },
        });
        (id, child)
    }

    /// Continue in `next_state` on a later cycle, handing it `payload`.
    pub fn call_state(&mut self, next_state: &str, payload: Value) -> RequestId {
        let id = self.allocate(next_state, CallTarget::State);
        self.outbound.push(OutboundCall::StateResponse {
            request_id: id,
            payload,
        });
        id
    }

    /// Send a message to the request that started this flow. Ignored for
    /// top-level flows.
    pub fn reply(&mut self, payload: Value) {
        let Some(parent) = self.parent.clone() else {
            self.log("reply dropped: flow has no parent");
            return;
        };
        let response_id = ResponseId(self.replies_sent);
        self.replies_sent += 1;
        self.outbound.push(OutboundCall::ParentReply {
            parent,
            response_id,
            payload,
        });
    }

    pub fn terminate(&mut self) {
        if self.is_running() {
            self.status = FlowStatus::Terminated;
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(
            session_id = %self.session_id,
            state = %self.current_state,
            "{}",
            message
        );
        self.log.push(FlowLogEntry {
            at: Utc::now(),
            state: self.current_state.clone(),
            message,
        });
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
    }

    /// Lowest-numbered outstanding request.
    pub fn next_pending(&self) -> Option<&PendingRequest> {
        self.pending_requests.values().next()
    }

    pub(crate) fn fail(&mut self, error: &FlowError) {
        self.status = FlowStatus::Error;
        self.error = Some(error.to_string());
    }

    /// Queue the final status for the parent request, if any. Only valid
    /// once the flow has left RUNNING.
    pub(crate) fn close_parent(&mut self) {
        let Some(parent) = self.parent.clone() else {
            return;
        };
        let status = match self.status {
            FlowStatus::Running => return,
            FlowStatus::Terminated => Status::Ok,
            FlowStatus::Error => Status::error(self.error.clone().unwrap_or_default()),
        };
        self.outbound.push(OutboundCall::ParentStatus {
            parent,
            response_id: ResponseId(self.replies_sent),
            status,
        });
    }

    pub(crate) fn take_outbound(&mut self) -> Vec<OutboundCall> {
        std::mem::take(&mut self.outbound)
    }

    /// Continuations stay legal only while a request naming them is
    /// outstanding.
    pub(crate) fn settle_next_states(&mut self) {
        self.next_states = self
            .pending_requests
            .values()
            .map(|p| p.next_state.clone())
            .collect();
        self.updated_at = Utc::now();
    }

    fn allocate(&mut self, next_state: &str, target: CallTarget) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        self.pending_requests.insert(
            id,
            PendingRequest {
                id,
                next_state: next_state.to_string(),
                target,
            },
        );
        self.next_states.insert(next_state.to_string());
        id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// Raised by flow code; the flow moves to ERROR.
    #[error("Flow failed: {0}")]
    Application(String),

    #[error("Illegal transition into '{state}', allowed: {allowed:?}")]
    IllegalTransition { state: String, allowed: Vec<String> },

    #[error("Flow has no state named '{0}'")]
    UnknownState(String),

    #[error("Flow snapshot unusable: {0}")]
    Snapshot(String),

    #[error("No flow registered under '{0}'")]
    UnknownFlow(String),
}

impl FlowError {
    pub fn application(message: impl Into<String>) -> Self {
        FlowError::Application(message.into())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Snapshot(err.to_string())
    }
}

/// Live handles shared with flows after they are resumed. Never serialized.
#[derive(Clone, Default)]
pub struct FlowResources {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl FlowResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: Arc<T>) {
        self.values.insert(TypeId::of::<T>(), value);
    }

    pub fn with<T: Any + Send + Sync>(mut self, value: Arc<T>) -> Self {
        self.insert(value);
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }
}

impl fmt::Debug for FlowResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowResources")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Behaviour of a flow.
pub trait FlowLogic: Send {
    /// Entry point, run once when the flow is created. Must be quick: real
    /// work belongs in later states.
    fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError>;

    /// Resume in `state` with the answers to one request.
    fn handle(&mut self, state: &str, responses: Responses, ctx: &mut FlowContext) -> Result<(), FlowError>;

    /// Drop live handles before the flow is serialized.
    fn prepare_for_suspend(&mut self) {}

    /// Reattach live handles after the flow was deserialized.
    fn resume_from_snapshot(&mut self, _resources: &FlowResources) {}
}

/// A named, serializable flow that can be registered with a `FlowRegistry`.
pub trait FlowDefinition: FlowLogic + Serialize + DeserializeOwned + 'static {
    const NAME: &'static str;

    type Args: DeserializeOwned;

    fn create(args: Self::Args) -> Result<Self, FlowError>;
}

/// Persisted form of a suspended flow: the task record payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_name: String,
    pub context: FlowContext,
    pub state: Value,
}

impl FlowSnapshot {
    pub fn to_bytes(&self) -> Result<bytes::Bytes, FlowError> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FlowError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_id_parts() {
        let id = SessionId::new("flows");
        assert_eq!(id.queue(), "flows");
        assert!(id.as_str().starts_with("flows:"));
        assert_eq!(
            id.responses_collection().as_str(),
            format!("{}/responses", id)
        );
        assert!("noqueue".parse::<SessionId>().is_err());
        assert!(":x".parse::<SessionId>().is_err());
        assert!(serde_json::from_value::<SessionId>(json!("a/b:c")).is_err());
    }

    #[test]
    fn test_calls_allocate_increasing_ids_and_declare_states() {
        let mut ctx = FlowContext::new(SessionId::new("flows"), "Demo", None);
        let a = ctx.call_state("A", json!(1));
        let b = ctx.call_client("agent-1", json!({"cmd": "ls"}), "B");
        let (c, child) = ctx.call_flow("Child", json!({}), "C");
        assert!(a < b && b < c);
        assert_eq!(child.queue(), "flows");
        assert_eq!(
            ctx.next_states.iter().cloned().collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert_eq!(ctx.take_outbound().len(), 3);
        assert!(ctx.take_outbound().is_empty());
    }

    #[test]
    fn test_snapshot_survives_roundtrip_without_outbound() {
        let mut ctx = FlowContext::new(SessionId::new("flows"), "Demo", None);
        ctx.call_state("A", json!(null));
        let snapshot = FlowSnapshot {
            flow_name: "Demo".into(),
            context: ctx,
            state: json!({"count": 1}),
        };
        let restored = FlowSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        let mut context = restored.context;
        assert_eq!(context.pending_requests.len(), 1);
        assert!(context.take_outbound().is_empty());
        assert_eq!(restored.state, json!({"count": 1}));
    }

    #[test]
    fn test_reply_without_parent_is_logged() {
        let mut ctx = FlowContext::new(SessionId::new("flows"), "Demo", None);
        ctx.reply(json!("hi"));
        assert!(ctx.take_outbound().is_empty());
        assert_eq!(ctx.log.len(), 1);
    }

    #[test]
    fn test_resources_lookup_by_type() {
        let resources = FlowResources::new().with(Arc::new(42u32));
        assert_eq!(resources.get::<u32>().as_deref(), Some(&42));
        assert!(resources.get::<String>().is_none());
    }
}
