// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod job_store;
pub mod secret_store;
pub mod transport;

pub use clock::ClockPort;
pub use job_store::JobStorePort;
pub use secret_store::SecretStorePort;
pub use transport::{RemoteTransport, TransportConnector};
