// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod memory_store;
pub mod telemetry;

pub use event_bus::{EventBus, FleetEvent};
pub use memory_store::InMemoryStore;
