// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Fleet Core
//!
//! Task distribution for a fleet of orchestrator processes sharing one
//! key/value store: append logs, sparse positional indexes, lease queues
//! and resumable flows executed by competing workers.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain types, application services and store backends

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
