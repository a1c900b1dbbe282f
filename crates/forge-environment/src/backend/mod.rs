// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend module - job execution units.

pub mod container;
pub mod mock;
mod traits;

pub use container::{ContainerBackend, ContainerBackendConfig};
pub use mock::{MockBackend, MockBehavior};
pub use traits::*;
