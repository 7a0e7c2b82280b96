// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Node - wires the task-distribution services of one process
//!
//! A node owns one [`BackgroundIndexer`] and one [`FlowWorker`], both built
//! from a [`FleetConfigManifest`] over a shared [`Store`]. Embedding servers
//! construct a node, call [`FleetNode::start`] and keep the returned handles
//! until [`FleetNode::shutdown`].

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::application::background_indexer::BackgroundIndexer;
use crate::application::flow_runner::{FlowRegistry, FlowRunner};
use crate::application::flow_store::FlowStore;
use crate::application::indexed_log::IndexedLog;
use crate::application::response_inbox::{ClientTaskQueue, ResponseInbox};
use crate::application::worker::FlowWorker;
use crate::domain::clock::Clock;
use crate::domain::config::FleetConfigManifest;
use crate::domain::flow::{FlowResources, SessionId};
use crate::domain::record::CollectionId;
use crate::domain::store::Store;
use crate::infrastructure::event_bus::EventBus;

pub struct FleetNode {
    config: FleetConfigManifest,
    flows: FlowStore,
    indexer: Arc<BackgroundIndexer>,
    worker: Arc<FlowWorker>,
    event_bus: EventBus,
}

/// Background tasks of a started node.
pub struct NodeHandles {
    pub indexer: JoinHandle<()>,
    pub worker: JoinHandle<()>,
}

impl FleetNode {
    pub fn new(
        config: FleetConfigManifest,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        registry: FlowRegistry,
        resources: FlowResources,
    ) -> Self {
        let event_bus = EventBus::with_default_capacity();
        let spec = &config.spec;
        let flows = FlowStore::new(store.clone(), clock.clone(), spec.queue.clone())
            .with_event_bus(event_bus.clone());
        let indexer = Arc::new(BackgroundIndexer::new(store, clock, spec.index.clone()));
        let runner = FlowRunner::new(Arc::new(registry), resources);
        let worker = Arc::new(FlowWorker::new(
            flows.clone(),
            runner,
            spec.worker.clone(),
            event_bus.clone(),
        ));
        Self {
            config,
            flows,
            indexer,
            worker,
            event_bus,
        }
    }

    pub fn config(&self) -> &FleetConfigManifest {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn flows(&self) -> &FlowStore {
        &self.flows
    }

    pub fn indexer(&self) -> &Arc<BackgroundIndexer> {
        &self.indexer
    }

    pub fn worker(&self) -> &Arc<FlowWorker> {
        &self.worker
    }

    pub fn inbox(&self) -> ResponseInbox {
        ResponseInbox::new(self.flows.clone())
    }

    pub fn client_tasks(&self, client_id: &str) -> ClientTaskQueue {
        ClientTaskQueue::new(self.flows.clone(), client_id)
    }

    /// A positional view of any collection, registered with this node's
    /// indexer on append.
    pub fn indexed_log(&self, id: CollectionId) -> IndexedLog {
        IndexedLog::new(self.flows.log(id), &self.config.spec.index).with_indexer(self.indexer.clone())
    }

    /// Start a flow on the first configured queue.
    pub async fn start_flow(&self, flow_name: &str, args: Value) -> anyhow::Result<SessionId> {
        let queue = self
            .config
            .spec
            .worker
            .queues
            .first()
            .ok_or_else(|| anyhow::anyhow!("spec.worker.queues is empty"))?;
        self.worker.start_flow(queue, flow_name, args).await
    }

    pub fn start(&self) -> NodeHandles {
        info!(node = %self.config.metadata.name, "Starting fleet node");
        NodeHandles {
            indexer: self.indexer.clone().start(),
            worker: self.worker.clone().start(),
        }
    }

    pub async fn shutdown(&self, handles: NodeHandles) {
        self.indexer.shutdown_token().cancel();
        self.worker.shutdown_token().cancel();
        let _ = handles.indexer.await;
        let _ = handles.worker.await;
        info!(node = %self.config.metadata.name, "Fleet node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::record::Timestamp;
    use crate::infrastructure::memory_store::InMemoryStore;
    use bytes::Bytes;

    fn node() -> FleetNode {
        FleetNode::new(
            FleetConfigManifest::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(Timestamp(1_000_000))),
            FlowRegistry::new(),
            FlowResources::new(),
        )
    }

    #[tokio::test]
    async fn test_indexed_logs_register_with_the_node_indexer() {
        let node = node();
        let id = CollectionId::new("agents/audit");
        node.indexed_log(id.clone()).add(Bytes::from_static(b"x")).await.unwrap();
        assert!(node.indexer().is_registered(&id));
    }

    #[tokio::test]
    async fn test_unknown_flow_is_rejected_and_node_stops() {
        let node = node();
        assert!(node.start_flow("Missing", Value::Null).await.is_err());

        let handles = node.start();
        node.shutdown(handles).await;
        assert!(node.worker().shutdown_token().is_cancelled());
    }
}
