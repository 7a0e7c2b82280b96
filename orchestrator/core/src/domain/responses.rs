// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Responses
//!
//! Every outbound call a flow makes is answered by zero or more messages
//! followed by one status message, all tagged with the call's
//! [`RequestId`] and numbered by an ascending [`ResponseId`]:
//!
//! ```text
//! request 3:  #0 Message  #1 Message  #2 Status(Ok)
//! ```
//!
//! Transports may retransmit and reorder, so messages are collected in a
//! [`ResponseBook`] that drops duplicate response ids and only reports a
//! request complete once its status arrived and nothing below it is
//! missing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::flow::{PendingRequest, SessionId};

/// Identifies one outbound call of a flow. Allocated in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a message within the answer to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub u64);

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome reported by the trailing status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error { message: String },
}

impl Status {
    pub fn error(message: impl Into<String>) -> Self {
        Status::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseKind {
    Message,
    Status { status: Status },
}

/// One inbound message addressed to a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub response_id: ResponseId,
    #[serde(default)]
    pub payload: Value,
    pub kind: ResponseKind,
}

impl ResponseMessage {
    pub fn message(session_id: SessionId, request_id: RequestId, response_id: u64, payload: Value) -> Self {
        Self {
            session_id,
            request_id,
            response_id: ResponseId(response_id),
            payload,
            kind: ResponseKind::Message,
        }
    }

    pub fn status(session_id: SessionId, request_id: RequestId, response_id: u64, status: Status) -> Self {
        Self {
            session_id,
            request_id,
            response_id: ResponseId(response_id),
            payload: Value::Null,
            kind: ResponseKind::Status { status },
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self.kind, ResponseKind::Status { .. })
    }
}

/// Everything a state handler receives for one completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Responses {
    request: PendingRequest,
    messages: Vec<ResponseMessage>,
    status: Status,
}

impl Responses {
    pub fn new(request: PendingRequest, messages: Vec<ResponseMessage>, status: Status) -> Self {
        Self {
            request,
            messages,
            status,
        }
    }

    pub fn request(&self) -> &PendingRequest {
        &self.request
    }

    pub fn request_id(&self) -> RequestId {
        self.request.id
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn success(&self) -> bool {
        self.status.is_ok()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first(&self) -> Option<&Value> {
        self.messages.first().map(|m| &m.payload)
    }

    /// Message payloads in response id order, status excluded.
    pub fn payloads(&self) -> impl Iterator<Item = &Value> {
        self.messages.iter().map(|m| &m.payload)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResponseMessage> {
        self.messages.iter()
    }
}

/// Collects inbound messages per request, de-duplicated by response id.
#[derive(Debug, Default)]
pub struct ResponseBook<K> {
    requests: BTreeMap<RequestId, BTreeMap<ResponseId, (K, ResponseMessage)>>,
    duplicates: Vec<K>,
}

impl<K> ResponseBook<K> {
    pub fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    /// File `message` under its request. A second copy of a response id is
    /// kept aside so the caller can clean up its storage.
    pub fn insert(&mut self, handle: K, message: ResponseMessage) {
        let slot = self.requests.entry(message.request_id).or_default();
        if slot.contains_key(&message.response_id) {
            self.duplicates.push(handle);
            return;
        }
        slot.insert(message.response_id, (handle, message));
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests.keys().copied().collect()
    }

    /// Whether the status of `request_id` arrived with nothing missing below
    /// it.
    pub fn is_complete(&self, request_id: RequestId) -> bool {
        let Some(slot) = self.requests.get(&request_id) else {
            return false;
        };
        let Some((status_id, _)) = slot.iter().find(|(_, (_, m))| m.is_status()) else {
            return false;
        };
        (0..status_id.0).all(|id| slot.contains_key(&ResponseId(id)))
    }

    /// Remove a completed request, returning its ordered messages, the
    /// status and every storage handle that belonged to it.
    pub fn take(&mut self, request: PendingRequest) -> Option<(Responses, Vec<K>)> {
        if !self.is_complete(request.id) {
            return None;
        }
        let slot = self.requests.remove(&request.id)?;
        let mut handles = Vec::with_capacity(slot.len());
        let mut messages = Vec::new();
        let mut status = None;
        for (_, (handle, message)) in slot {
            handles.push(handle);
            if status.is_some() {
                // Anything after the status is stray.
                continue;
            }
            match message.kind {
                ResponseKind::Status { status: s } => status = Some(s),
                ResponseKind::Message => messages.push(message),
            }
        }
        let status = status?;
        Some((Responses::new(request, messages, status), handles))
    }

    /// Drop everything filed under `request_id`, returning the handles.
    pub fn discard(&mut self, request_id: RequestId) -> Vec<K> {
        self.requests
            .remove(&request_id)
            .map(|slot| slot.into_values().map(|(handle, _)| handle).collect())
            .unwrap_or_default()
    }

    pub fn take_duplicates(&mut self) -> Vec<K> {
        std::mem::take(&mut self.duplicates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::CallTarget;
    use serde_json::json;

    fn session() -> SessionId {
        "flows:abc".parse().unwrap()
    }

    fn pending(id: u64) -> PendingRequest {
        PendingRequest {
            id: RequestId(id),
            next_state: "Done".to_string(),
            target: CallTarget::State,
        }
    }

    #[test]
    fn test_out_of_order_duplicates_are_collated() {
        let s = session();
        let r = RequestId(1);
        let mut book = ResponseBook::new();
        book.insert("k2", ResponseMessage::status(s.clone(), r, 2, Status::Ok));
        book.insert("k1", ResponseMessage::message(s.clone(), r, 1, json!("b")));
        assert!(!book.is_complete(r));
        book.insert("k1-dup", ResponseMessage::message(s.clone(), r, 1, json!("b")));
        book.insert("k0", ResponseMessage::message(s.clone(), r, 0, json!("a")));
        assert!(book.is_complete(r));

        let (responses, mut handles) = book.take(pending(1)).unwrap();
        assert!(responses.success());
        assert_eq!(responses.payloads().cloned().collect::<Vec<_>>(), vec![json!("a"), json!("b")]);
        handles.sort();
        assert_eq!(handles, vec!["k0", "k1", "k2"]);
        assert_eq!(book.take_duplicates(), vec!["k1-dup"]);
    }

    #[test]
    fn test_status_only_request_is_complete() {
        let mut book = ResponseBook::new();
        book.insert((), ResponseMessage::status(session(), RequestId(4), 0, Status::error("boom")));
        let (responses, _) = book.take(pending(4)).unwrap();
        assert!(responses.is_empty());
        assert_eq!(responses.status(), &Status::error("boom"));
    }

    #[test]
    fn test_message_wire_format() {
        let message = ResponseMessage::status(session(), RequestId(3), 1, Status::Ok);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "session_id": "flows:abc",
                "request_id": 3,
                "response_id": 1,
                "payload": null,
                "kind": {"kind": "status", "status": {"status": "ok"}}
            })
        );
        let back: ResponseMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }
}
