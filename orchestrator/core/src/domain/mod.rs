// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Value types, wire formats and contracts shared by the application layer.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Records, leases, indexes, flows and the store contract

pub mod clock;
pub mod config;
pub mod events;
pub mod flow;
pub mod index;
pub mod lease;
pub mod record;
pub mod responses;
pub mod store;
