// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod append_log;
pub mod indexed_log;
pub mod background_indexer;
pub mod lease_queue;
pub mod flow_runner;
pub mod flow_store;
pub mod response_inbox;
pub mod worker;
pub mod fleet_node;

// Re-export services for convenience
pub use append_log::{AppendLog, ScanOptions};
pub use background_indexer::{BackgroundIndexer, IndexerCycle};
pub use fleet_node::{FleetNode, NodeHandles};
pub use flow_runner::{Execution, FlowRegistry, FlowRunner};
pub use flow_store::FlowStore;
pub use indexed_log::IndexedLog;
pub use lease_queue::{LeaseQueue, QueueError};
pub use response_inbox::{ClaimedTask, ClientTaskQueue, ResponseInbox};
pub use worker::{CycleReport, FlowWorker};
