// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! End-to-end flow execution: competing workers, client round trips and
//! child flows, all over one in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegis_fleet_core::application::{ClientTaskQueue, FlowRegistry, FlowRunner, FlowStore, FlowWorker};
use aegis_fleet_core::clock::{Clock, ManualClock};
use aegis_fleet_core::config::{QueueConfig, WorkerConfig};
use aegis_fleet_core::events::FlowEvent;
use aegis_fleet_core::flow::{FlowContext, FlowDefinition, FlowError, FlowLogic, FlowResources, FlowStatus};
use aegis_fleet_core::infrastructure::{EventBus, FleetEvent, InMemoryStore};
use aegis_fleet_core::record::Timestamp;
use aegis_fleet_core::responses::{Responses, Status};
use aegis_fleet_core::store::Store;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const AGENT: &str = "agent-1";

/// Asks the agent twice: Start → A → B.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Relay {
    answers: Vec<Value>,
}

impl FlowLogic for Relay {
    fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError> {
        ctx.call_client(AGENT, json!({"step": 1}), "A");
        Ok(())
    }

    fn handle(&mut self, state: &str, responses: Responses, ctx: &mut FlowContext) -> Result<(), FlowError> {
        self.answers.extend(responses.payloads().cloned());
        match state {
            "A" => {
                ctx.call_client(AGENT, json!({"step": 2}), "B");
                Ok(())
            }
            "B" => {
                ctx.terminate();
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

impl FlowDefinition for Relay {
    const NAME: &'static str = "Relay";
    type Args = Value;

    fn create(_args: Value) -> Result<Self, FlowError> {
        Ok(Self::default())
    }
}

/// Replies with twice its argument and finishes during `start`.
#[derive(Debug, Serialize, Deserialize)]
struct Doubler {
    value: i64,
}

impl FlowLogic for Doubler {
    fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError> {
        ctx.reply(json!(self.value * 2));
        ctx.terminate();
        Ok(())
    }

    fn handle(&mut self, state: &str, _responses: Responses, _ctx: &mut FlowContext) -> Result<(), FlowError> {
        Err(FlowError::UnknownState(state.to_string()))
    }
}

impl FlowDefinition for Doubler {
    const NAME: &'static str = "Doubler";
    type Args = i64;

    fn create(value: i64) -> Result<Self, FlowError> {
        Ok(Self { value })
    }
}

/// Delegates to a child flow, then reports the outcome to the agent.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Parent {
    child: String,
    result: Option<Value>,
    succeeded: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ParentArgs {
    child: String,
}

impl FlowLogic for Parent {
    fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError> {
        let child = self.child.clone();
        ctx.call_flow(&child, json!(21), "Collect");
        Ok(())
    }

    fn handle(&mut self, state: &str, responses: Responses, ctx: &mut FlowContext) -> Result<(), FlowError> {
        match state {
            "Collect" => {
                self.result = responses.first().cloned();
                self.succeeded = Some(responses.success());
                ctx.call_client(AGENT, json!({"result": self.result}), "Done");
                Ok(())
            }
            "Done" => {
                ctx.terminate();
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }
}

impl FlowDefinition for Parent {
    const NAME: &'static str = "Parent";
    type Args = ParentArgs;

    fn create(args: ParentArgs) -> Result<Self, FlowError> {
        Ok(Self {
            child: args.child,
            ..Self::default()
        })
    }
}

/// Pushes the shared clock past the flow lease the next time a slow state
/// runs.
struct Stall {
    clock: Arc<ManualClock>,
    armed: AtomicBool,
}

impl Stall {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn trip(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.clock.advance(WorkerConfig::default().flow_lease + Duration::from_secs(60));
        }
    }
}

/// One slow state, then either terminates or asks the agent again.
/// Fails when the agent answers "boom".
#[derive(Default, Serialize, Deserialize)]
struct Sleeper {
    terminate: bool,
    answers: Vec<Value>,
    #[serde(skip)]
    stall: Option<Arc<Stall>>,
}

#[derive(Debug, Deserialize)]
struct SleeperArgs {
    terminate: bool,
}

impl FlowLogic for Sleeper {
    fn start(&mut self, ctx: &mut FlowContext) -> Result<(), FlowError> {
        ctx.call_client(AGENT, json!({"step": 1}), "Slow");
        Ok(())
    }

    fn handle(&mut self, state: &str, responses: Responses, ctx: &mut FlowContext) -> Result<(), FlowError> {
        match state {
            "Slow" => {
                if let Some(stall) = &self.stall {
                    stall.trip();
                }
                if responses.payloads().any(|p| p == &json!("boom")) {
                    return Err(FlowError::application("boom"));
                }
                self.answers.extend(responses.payloads().cloned());
                if self.terminate {
                    ctx.terminate();
                } else {
                    ctx.call_client(AGENT, json!({"step": 2}), "Done");
                }
                Ok(())
            }
            "Done" => {
                ctx.terminate();
                Ok(())
            }
            other => Err(FlowError::UnknownState(other.to_string())),
        }
    }

    fn prepare_for_suspend(&mut self) {
        self.stall = None;
    }

    fn resume_from_snapshot(&mut self, resources: &FlowResources) {
        self.stall = resources.get::<Stall>();
    }
}

impl FlowDefinition for Sleeper {
    const NAME: &'static str = "Sleeper";
    type Args = SleeperArgs;

    fn create(args: SleeperArgs) -> Result<Self, FlowError> {
        Ok(Self {
            terminate: args.terminate,
            ..Self::default()
        })
    }
}

struct Fleet {
    flows: FlowStore,
    event_bus: EventBus,
    stall: Arc<Stall>,
    workers: Vec<FlowWorker>,
}

fn fleet(workers: usize) -> Fleet {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(Timestamp(1_700_000_000_000_000)));
    let event_bus = EventBus::with_default_capacity();
    let stall = Arc::new(Stall {
        clock: clock.clone(),
        armed: AtomicBool::new(false),
    });
    let flows = FlowStore::new(store, clock, QueueConfig::default()).with_event_bus(event_bus.clone());
    let registry = Arc::new(
        FlowRegistry::new()
            .with::<Relay>()
            .with::<Doubler>()
            .with::<Parent>()
            .with::<Sleeper>(),
    );

    let workers = (0..workers)
        .map(|i| {
            let config = WorkerConfig {
                worker_id: Some(format!("worker-{}", i)),
                ..WorkerConfig::default()
            };
            FlowWorker::new(
                flows.clone(),
                FlowRunner::new(registry.clone(), FlowResources::new().with(stall.clone())),
                config,
                event_bus.clone(),
            )
        })
        .collect();

    Fleet {
        flows,
        event_bus,
        stall,
        workers,
    }
}

/// Answer every pending request of the agent with `payload`.
async fn answer_agent(flows: &FlowStore, payload: Value) -> usize {
    let agent = ClientTaskQueue::new(flows.clone(), AGENT);
    let tasks = agent.claim(10, Duration::from_secs(60)).await.unwrap();
    for task in &tasks {
        agent.respond(task, vec![payload.clone()], Status::Ok).await.unwrap();
    }
    tasks.len()
}

#[tokio::test]
async fn test_competing_workers_execute_a_state_once_and_release_the_lease() {
    let fleet = fleet(2);
    let session = fleet.workers[0]
        .start_flow("flows", "Relay", json!({}))
        .await
        .unwrap();

    let (_, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.next_states.iter().collect::<Vec<_>>(), vec!["A"]);

    assert_eq!(answer_agent(&fleet.flows, json!("first")).await, 1);
    let mut events = fleet.event_bus.subscribe();

    let (a, b) = tokio::join!(fleet.workers[0].run_once(), fleet.workers[1].run_once());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.states_executed + b.states_executed, 1);
    assert!(a.failures.is_empty() && b.failures.is_empty());

    let (key, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.current_state, "A");
    assert_eq!(snapshot.context.status, FlowStatus::Running);
    assert_eq!(snapshot.state, json!({"answers": ["first"]}));
    assert_eq!(
        fleet.flows.task_queue(&session).lease_of(&key).await.unwrap(),
        None
    );
    assert!(fleet.flows.notifications("flows").log().is_empty().await.unwrap());
    assert!(fleet.flows.read_responses(&session).await.unwrap().0.is_empty());

    let mut executed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::Flow(FlowEvent::StateExecuted { state, .. }) = event {
            executed.push(state);
        }
    }
    assert_eq!(executed, vec!["A"]);

    // Nothing left to do for either worker.
    for worker in &fleet.workers {
        let report = worker.run_once().await.unwrap();
        assert!(report.is_idle());
    }
}

#[tokio::test]
async fn test_flow_runs_to_termination_and_is_deleted() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker.start_flow("flows", "Relay", json!({})).await.unwrap();

    answer_agent(&fleet.flows, json!(1)).await;
    assert_eq!(worker.run_once().await.unwrap().states_executed, 1);

    answer_agent(&fleet.flows, json!(2)).await;
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.states_executed, 1);
    assert_eq!(report.flows_terminated, 1);

    assert!(fleet.flows.load_snapshot(&session).await.unwrap().is_none());
    assert!(fleet.flows.responses_log(&session).is_empty().await.unwrap());

    // A late wake-up for the deleted flow is dropped quietly.
    fleet.flows.notify(&session).await.unwrap();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.sessions_inactive, 1);
    assert!(fleet.flows.notifications("flows").log().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_child_flow_replies_resume_the_parent() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker
        .start_flow("flows", "Parent", json!({"child": "Doubler"}))
        .await
        .unwrap();

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.states_executed, 1);

    let (_, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.current_state, "Collect");
    assert_eq!(snapshot.state["result"], json!(42));
    assert_eq!(snapshot.state["succeeded"], json!(true));

    let agent = ClientTaskQueue::new(fleet.flows.clone(), AGENT);
    let tasks = agent.claim(10, Duration::from_secs(60)).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task.payload, json!({"result": 42}));
    agent.respond(&tasks[0], Vec::new(), Status::Ok).await.unwrap();

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.flows_terminated, 1);
    assert!(fleet.flows.load_snapshot(&session).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_child_flow_fails_the_parent_request() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker
        .start_flow("flows", "Parent", json!({"child": "Missing"}))
        .await
        .unwrap();

    worker.run_once().await.unwrap();
    let (_, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.status, FlowStatus::Running);
    assert_eq!(snapshot.state["succeeded"], json!(false));
    assert_eq!(snapshot.state["result"], Value::Null);
}

#[tokio::test]
async fn test_unknown_root_flow_is_rejected() {
    let fleet = fleet(1);
    assert!(fleet.workers[0]
        .start_flow("flows", "Nope", json!({}))
        .await
        .is_err());
    assert!(fleet.flows.notifications("flows").log().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_lease_lost_during_execution_keeps_snapshot_and_responses() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker
        .start_flow("flows", "Sleeper", json!({"terminate": false}))
        .await
        .unwrap();
    assert_eq!(answer_agent(&fleet.flows, json!("late")).await, 1);

    fleet.stall.arm();
    let mut events = fleet.event_bus.subscribe();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.states_executed, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, session);

    // Nothing of the lost cycle was kept.
    let (_, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.current_state, "Start");
    assert_eq!(snapshot.state["answers"], json!([]));
    assert!(!fleet.flows.read_responses(&session).await.unwrap().0.is_empty());
    assert_eq!(ClientTaskQueue::new(fleet.flows.clone(), AGENT).pending().await.unwrap(), 0);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, FleetEvent::Flow(FlowEvent::StateExecuted { .. })));
    }

    // The lease has run out, so the next cycle redoes the state.
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.states_executed, 1);
    assert!(report.failures.is_empty());
    let (_, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.current_state, "Slow");
    assert_eq!(snapshot.state["answers"], json!(["late"]));
    assert!(fleet.flows.read_responses(&session).await.unwrap().0.is_empty());
    assert_eq!(ClientTaskQueue::new(fleet.flows.clone(), AGENT).pending().await.unwrap(), 1);
}

#[tokio::test]
async fn test_lease_lost_before_termination_keeps_the_flow() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker
        .start_flow("flows", "Sleeper", json!({"terminate": true}))
        .await
        .unwrap();
    answer_agent(&fleet.flows, json!("done")).await;

    fleet.stall.arm();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.flows_terminated, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(fleet.flows.load_snapshot(&session).await.unwrap().is_some());

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.flows_terminated, 1);
    assert!(fleet.flows.load_snapshot(&session).await.unwrap().is_none());
}

#[tokio::test]
async fn test_handler_error_persists_the_flow_as_errored() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker
        .start_flow("flows", "Sleeper", json!({"terminate": false}))
        .await
        .unwrap();
    answer_agent(&fleet.flows, json!("boom")).await;

    let mut events = fleet.event_bus.subscribe();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.flows_errored, 1);
    assert_eq!(report.states_executed, 0);
    assert!(report.failures.is_empty());

    let (key, snapshot) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    assert_eq!(snapshot.context.status, FlowStatus::Error);
    assert_eq!(snapshot.context.pending_requests.len(), 1);
    assert_eq!(fleet.flows.task_queue(&session).lease_of(&key).await.unwrap(), None);
    // The answer that broke the flow is kept for inspection.
    assert!(!fleet.flows.read_responses(&session).await.unwrap().0.is_empty());

    let mut errored = false;
    while let Ok(event) = events.try_recv() {
        errored |= matches!(event, FleetEvent::Flow(FlowEvent::FlowErrored { .. }));
    }
    assert!(errored);

    // Later wake-ups see an inactive flow.
    fleet.flows.notify(&session).await.unwrap();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.sessions_inactive, 1);
    assert!(fleet.flows.load_snapshot(&session).await.unwrap().is_some());
}

#[tokio::test]
async fn test_undecodable_snapshot_is_reported_and_left_in_place() {
    let fleet = fleet(1);
    let worker = &fleet.workers[0];
    let session = worker.start_flow("flows", "Relay", json!({})).await.unwrap();

    let (key, _) = fleet.flows.load_snapshot(&session).await.unwrap().unwrap();
    let tasks = fleet.flows.task_queue(&session);
    let now = fleet.flows.clock().now();
    tasks
        .log()
        .store()
        .set(tasks.log().subject(), &key.column(), Bytes::from_static(b"{not json"), now)
        .await
        .unwrap();
    fleet.flows.notify(&session).await.unwrap();

    let mut events = fleet.event_bus.subscribe();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, session);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, FleetEvent::Flow(FlowEvent::SnapshotFailed { .. }));
    }
    assert!(failed);

    assert!(!tasks.log().is_empty().await.unwrap());
    assert_eq!(tasks.lease_of(&key).await.unwrap(), None);
    assert!(worker.run_once().await.unwrap().is_idle());
}
