// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Flow Runner - drives flow state machines between suspensions
//!
//! The runner is pure: it turns a snapshot plus a batch of inbound
//! responses into a new snapshot plus the outbound calls the handlers made.
//! Reading and writing the store is the worker's job.
//!
//! Requests are delivered strictly in [`RequestId`] order. Delivery stops at
//! the first outstanding request whose answers are incomplete, even if later
//! requests are already complete.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::flow::{
    FlowContext, FlowDefinition, FlowError, FlowLogic, FlowResources, FlowSnapshot, OutboundCall,
    ParentLink, SessionId,
};
use crate::domain::responses::{ResponseBook, ResponseMessage};

/// A flow object that can also serialize itself.
pub trait FlowInstance: FlowLogic {
    fn to_state(&self) -> Result<Value, FlowError>;
}

impl<F: FlowDefinition> FlowInstance for F {
    fn to_state(&self) -> Result<Value, FlowError> {
        Ok(serde_json::to_value(self)?)
    }
}

trait FlowFactory: Send + Sync {
    fn create(&self, args: Value) -> Result<Box<dyn FlowInstance>, FlowError>;
    fn restore(&self, state: Value) -> Result<Box<dyn FlowInstance>, FlowError>;
}

struct TypedFactory<F>(PhantomData<fn() -> F>);

impl<F: FlowDefinition> FlowFactory for TypedFactory<F> {
    fn create(&self, args: Value) -> Result<Box<dyn FlowInstance>, FlowError> {
        let args: F::Args = serde_json::from_value(args)
            .map_err(|e| FlowError::application(format!("invalid arguments for {}: {}", F::NAME, e)))?;
        Ok(Box::new(F::create(args)?))
    }

    fn restore(&self, state: Value) -> Result<Box<dyn FlowInstance>, FlowError> {
        let flow: F = serde_json::from_value(state)?;
        Ok(Box::new(flow))
    }
}

/// Flow name → typed constructor.
#[derive(Default, Clone)]
pub struct FlowRegistry {
    factories: HashMap<&'static str, Arc<dyn FlowFactory>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F: FlowDefinition>(&mut self) -> &mut Self {
        self.factories
            .insert(F::NAME, Arc::new(TypedFactory::<F>(PhantomData)));
        self
    }

    pub fn with<F: FlowDefinition>(mut self) -> Self {
        self.register::<F>();
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn factory(&self, name: &str) -> Result<&Arc<dyn FlowFactory>, FlowError> {
        self.factories
            .get(name)
            .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))
    }
}

/// What one run of a flow produced.
#[derive(Debug)]
pub struct Execution<K> {
    pub snapshot: FlowSnapshot,
    pub outbound: Vec<OutboundCall>,
    /// States whose handlers ran, in order.
    pub executed_states: Vec<String>,
    /// Storage handles of responses that were delivered or are no longer
    /// wanted.
    pub consumed: Vec<K>,
    /// Error that moved the flow to ERROR during this run.
    pub error: Option<FlowError>,
}

impl<K> Execution<K> {
    pub fn context(&self) -> &FlowContext {
        &self.snapshot.context
    }
}

#[derive(Clone)]
pub struct FlowRunner {
    registry: Arc<FlowRegistry>,
    resources: FlowResources,
}

impl FlowRunner {
    pub fn new(registry: Arc<FlowRegistry>, resources: FlowResources) -> Self {
        Self { registry, resources }
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Create flow `flow_name` and run its `start`.
    ///
    /// A failing `start` still yields an execution: the flow is in ERROR and
    /// the parent, if any, is told so.
    pub fn start_flow<K>(
        &self,
        session_id: SessionId,
        flow_name: &str,
        args: Value,
        parent: Option<ParentLink>,
    ) -> Result<Execution<K>, FlowError> {
        let factory = self.registry.factory(flow_name)?;
        let mut ctx = FlowContext::new(session_id, flow_name, parent);

        let mut error = None;
        match factory.create(args) {
            Ok(mut flow) => {
                flow.resume_from_snapshot(&self.resources);
                if let Err(e) = flow.start(&mut ctx) {
                    warn!(session_id = %ctx.session_id, "Flow start failed: {}", e);
                    ctx.fail(&e);
                    error = Some(e);
                }
                metrics::counter!("aegis_fleet_flows_started_total").increment(1);
                self.suspend(flow, ctx, Vec::new(), Vec::new(), error)
            }
            Err(e) => {
                ctx.fail(&e);
                let state = Value::Null;
                ctx.close_parent();
                ctx.settle_next_states();
                let outbound = ctx.take_outbound();
                Ok(Execution {
                    snapshot: FlowSnapshot {
                        flow_name: flow_name.to_string(),
                        context: ctx,
                        state,
                    },
                    outbound,
                    executed_states: Vec::new(),
                    consumed: Vec::new(),
                    error: Some(e),
                })
            }
        }
    }

    /// Resume a suspended flow with whatever responses are stored for it.
    pub fn execute<K>(
        &self,
        snapshot: FlowSnapshot,
        responses: Vec<(K, ResponseMessage)>,
    ) -> Result<Execution<K>, FlowError> {
        let factory = self.registry.factory(&snapshot.flow_name)?;
        let mut flow = factory.restore(snapshot.state)?;
        flow.resume_from_snapshot(&self.resources);
        let mut ctx = snapshot.context;

        let mut book = ResponseBook::new();
        for (handle, message) in responses {
            book.insert(handle, message);
        }
        let mut consumed = book.take_duplicates();
        for request_id in book.request_ids() {
            if !ctx.pending_requests.contains_key(&request_id) {
                debug!(
                    session_id = %ctx.session_id,
                    request_id = %request_id,
                    "Dropping responses for a request that is not outstanding"
                );
                consumed.extend(book.discard(request_id));
            }
        }

        let mut executed = Vec::new();
        let mut error = None;
        while ctx.is_running() {
            let Some(next) = ctx.next_pending().cloned() else {
                break;
            };
            if !book.is_complete(next.id) {
                break;
            }
            if !ctx.next_states.contains(&next.next_state) {
                let e = FlowError::IllegalTransition {
                    state: next.next_state.clone(),
                    allowed: ctx.next_states.iter().cloned().collect(),
                };
                ctx.fail(&e);
                error = Some(e);
                break;
            }
            let Some((delivered, handles)) = book.take(next.clone()) else {
                break;
            };
            ctx.pending_requests.remove(&next.id);
            ctx.current_state = next.next_state.clone();

            match flow.handle(&next.next_state, delivered, &mut ctx) {
                Ok(()) => {
                    consumed.extend(handles);
                    metrics::counter!("aegis_fleet_flow_transitions_total").increment(1);
                    executed.push(next.next_state);
                }
                Err(e) => {
                    warn!(
                        session_id = %ctx.session_id,
                        state = %next.next_state,
                        "Flow state failed: {}",
                        e
                    );
                    // The responses that triggered the failure stay stored.
                    ctx.pending_requests.insert(next.id, next);
                    ctx.fail(&e);
                    error = Some(e);
                    break;
                }
            }
        }

        self.suspend(flow, ctx, executed, consumed, error)
    }

    fn suspend<K>(
        &self,
        mut flow: Box<dyn FlowInstance>,
        mut ctx: FlowContext,
        executed_states: Vec<String>,
        consumed: Vec<K>,
        error: Option<FlowError>,
    ) -> Result<Execution<K>, FlowError> {
        if ctx.status.is_terminal() {
            ctx.close_parent();
        }
        ctx.settle_next_states();
        let outbound = ctx.take_outbound();
        flow.prepare_for_suspend();
        let state = flow.to_state()?;
        Ok(Execution {
            snapshot: FlowSnapshot {
                flow_name: ctx.flow_name.clone(),
                context: ctx,
                state,
            },
            outbound,
            executed_states,
            consumed,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::{FlowStatus, PendingRequest};
    use crate::domain::responses::{RequestId, Responses, Status};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    /// Counts greetings: Start → Greet → Done.
    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Greeter {
        greeted: Vec<String>,
    }

    impl FlowLogic for Greeter {
        fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError> {
            ctx.call_state("Greet", json!("first"));
            Ok(())
        }

        fn handle(&mut self, state: &str, responses: Responses, ctx: &mut FlowContext) -> Result<(), FlowError> {
            match state {
                "Greet" => {
                    for payload in responses.payloads() {
                        self.greeted.push(payload.as_str().unwrap_or_default().to_string());
                    }
                    ctx.call_state("Done", json!(null));
                    Ok(())
                }
                "Done" => {
                    ctx.terminate();
                    Ok(())
                }
                "Explode" => Err(FlowError::application("boom")),
                other => Err(FlowError::UnknownState(other.to_string())),
            }
        }
    }

    impl FlowDefinition for Greeter {
        const NAME: &'static str = "Greeter";
        type Args = ();

        fn create(_args: ()) -> Result<Self, FlowError> {
            Ok(Self::default())
        }
    }

    fn runner() -> FlowRunner {
        FlowRunner::new(Arc::new(FlowRegistry::new().with::<Greeter>()), FlowResources::new())
    }

    fn answer(ctx: &FlowContext, request: u64, payloads: &[Value]) -> Vec<(usize, ResponseMessage)> {
        let mut out = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            out.push((
                out.len(),
                ResponseMessage::message(ctx.session_id.clone(), RequestId(request), i as u64, payload.clone()),
            ));
        }
        out.push((
            out.len(),
            ResponseMessage::status(
                ctx.session_id.clone(),
                RequestId(request),
                payloads.len() as u64,
                Status::Ok,
            ),
        ));
        out
    }

    #[test]
    fn test_start_declares_next_state() {
        let execution: Execution<usize> = runner()
            .start_flow(SessionId::new("flows"), "Greeter", Value::Null, None)
            .unwrap();
        let ctx = execution.context();
        assert_eq!(ctx.status, FlowStatus::Running);
        assert!(ctx.next_states.contains("Greet"));
        assert_eq!(execution.outbound.len(), 1);
    }

    #[test]
    fn test_unknown_flow_is_rejected() {
        let err = runner()
            .start_flow::<usize>(SessionId::new("flows"), "Nope", Value::Null, None)
            .unwrap_err();
        assert_eq!(err, FlowError::UnknownFlow("Nope".into()));
    }

    #[test]
    fn test_execute_runs_states_in_request_order() {
        let runner = runner();
        let started: Execution<usize> = runner
            .start_flow(SessionId::new("flows"), "Greeter", Value::Null, None)
            .unwrap();
        let ctx = started.snapshot.context.clone();
        let mut responses = answer(&ctx, 1, &[json!("a"), json!("b")]);
        responses.reverse();

        let execution = runner.execute(started.snapshot, responses).unwrap();
        assert_eq!(execution.executed_states, vec!["Greet"]);
        assert_eq!(execution.consumed.len(), 3);
        assert_eq!(execution.snapshot.state, json!({"greeted": ["a", "b"]}));
        assert_eq!(execution.context().current_state, "Greet");
        assert_eq!(
            execution.context().next_states.iter().cloned().collect::<Vec<_>>(),
            vec!["Done"]
        );

        let done = answer(execution.context(), 2, &[]);
        let finished = runner.execute(execution.snapshot, done).unwrap();
        assert_eq!(finished.context().status, FlowStatus::Terminated);
    }

    #[test]
    fn test_incomplete_earlier_request_blocks_later_ones() {
        let runner = runner();
        let mut ctx = FlowContext::new(SessionId::new("flows"), "Greeter", None);
        ctx.call_state("Greet", json!(1));
        ctx.call_state("Done", json!(2));
        ctx.take_outbound();
        let snapshot = FlowSnapshot {
            flow_name: "Greeter".into(),
            context: ctx.clone(),
            state: json!({"greeted": []}),
        };

        // Only request 2 is complete.
        let execution = runner.execute(snapshot, answer(&ctx, 2, &[])).unwrap();
        assert!(execution.executed_states.is_empty());
        assert!(execution.consumed.is_empty());
        assert_eq!(execution.context().pending_requests.len(), 2);
    }

    #[test]
    fn test_undeclared_next_state_is_illegal() {
        let runner = runner();
        let mut ctx = FlowContext::new(SessionId::new("flows"), "Greeter", None);
        ctx.call_state("Greet", json!(1));
        ctx.take_outbound();
        ctx.pending_requests.insert(
            RequestId(1),
            PendingRequest {
                id: RequestId(1),
                next_state: "Done".into(),
                target: crate::domain::flow::CallTarget::State,
            },
        );
        let snapshot = FlowSnapshot {
            flow_name: "Greeter".into(),
            context: ctx.clone(),
            state: json!({"greeted": []}),
        };

        let execution = runner.execute(snapshot, answer(&ctx, 1, &[])).unwrap();
        assert!(matches!(execution.error, Some(FlowError::IllegalTransition { .. })));
        assert_eq!(execution.context().status, FlowStatus::Error);
    }

    #[test]
    fn test_handler_error_moves_flow_to_error_and_reports_parent() {
        let runner = runner();
        let parent = ParentLink {
            session_id: SessionId::new("flows"),
            request_id: RequestId(7),
        };
        let mut ctx = FlowContext::new(SessionId::new("flows"), "Greeter", Some(parent.clone()));
        ctx.call_state("Explode", json!(null));
        ctx.take_outbound();
        let snapshot = FlowSnapshot {
            flow_name: "Greeter".into(),
            context: ctx.clone(),
            state: json!({"greeted": []}),
        };

        let execution = runner.execute(snapshot, answer(&ctx, 1, &[json!(0)])).unwrap();
        assert_eq!(execution.context().status, FlowStatus::Error);
        assert_eq!(execution.error, Some(FlowError::application("boom")));
        assert!(execution.consumed.is_empty());
        assert!(execution.executed_states.is_empty());
        assert!(execution.context().pending_requests.contains_key(&RequestId(1)));
        assert!(matches!(
            &execution.outbound[..],
            [OutboundCall::ParentStatus { parent: p, status: Status::Error { .. }, .. }] if *p == parent
        ));
    }

    #[test]
    fn test_stale_and_duplicate_responses_are_consumed() {
        let runner = runner();
        let started: Execution<usize> = runner
            .start_flow(SessionId::new("flows"), "Greeter", Value::Null, None)
            .unwrap();
        let ctx = started.snapshot.context.clone();
        let mut responses = answer(&ctx, 1, &[json!("a")]);
        responses.push((10, ResponseMessage::message(ctx.session_id.clone(), RequestId(1), 0, json!("a"))));
        responses.push((11, ResponseMessage::status(ctx.session_id.clone(), RequestId(99), 0, Status::Ok)));

        let execution = runner.execute(started.snapshot, responses).unwrap();
        let mut consumed = execution.consumed.clone();
        consumed.sort_unstable();
        assert_eq!(consumed, vec![0, 1, 10, 11]);
        assert_eq!(execution.snapshot.state, json!({"greeted": ["a"]}));
    }

    /// Holds a process-local counter that must never reach the snapshot.
    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        seen: u32,
        #[serde(skip)]
        shared: Option<Arc<tokio::sync::Mutex<u32>>>,
    }

    impl FlowLogic for Counter {
        fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError> {
            ctx.call_state("Count", json!(null));
            Ok(())
        }

        fn handle(&mut self, _state: &str, _responses: Responses, ctx: &mut FlowContext) -> Result<(), FlowError> {
            let shared = self
                .shared
                .as_ref()
                .ok_or_else(|| FlowError::application("counter not attached"))?;
            let mut guard = shared
                .try_lock()
                .map_err(|_| FlowError::application("counter busy"))?;
            *guard += 1;
            self.seen = *guard;
            ctx.terminate();
            Ok(())
        }

        fn prepare_for_suspend(&mut self) {
            self.shared = None;
        }

        fn resume_from_snapshot(&mut self, resources: &FlowResources) {
            self.shared = resources.get::<tokio::sync::Mutex<u32>>();
        }
    }

    impl FlowDefinition for Counter {
        const NAME: &'static str = "Counter";
        type Args = ();

        fn create(_args: ()) -> Result<Self, FlowError> {
            Ok(Self::default())
        }
    }

    #[test]
    fn test_live_resources_are_reattached_after_resume() {
        let shared: Arc<tokio::sync::Mutex<u32>> = Arc::new(tokio::sync::Mutex::new(41));
        let runner = FlowRunner::new(
            Arc::new(FlowRegistry::new().with::<Counter>()),
            FlowResources::new().with(shared.clone()),
        );
        let started: Execution<usize> = runner
            .start_flow(SessionId::new("flows"), "Counter", Value::Null, None)
            .unwrap();
        assert_eq!(started.snapshot.state, json!({"seen": 0}));

        let ctx = started.snapshot.context.clone();
        let finished = runner.execute(started.snapshot, answer(&ctx, 1, &[])).unwrap();
        assert_eq!(finished.error, None);
        assert_eq!(finished.context().status, FlowStatus::Terminated);
        assert_eq!(finished.snapshot.state, json!({"seen": 42}));
        assert_eq!(*shared.try_lock().unwrap(), 42);
    }
}
