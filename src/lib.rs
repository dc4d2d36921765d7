// Copyright 2015-2020 Capital One Services, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # cap-invoke
//!
//! A client/worker SDK for calling versioned capabilities over a NATS
//! message bus. Capability references are resolved to a subject and bus
//! through a registry bootstrap/lookup protocol, cached with
//! stale-while-revalidate semantics, and invoked through a composable
//! middleware pipeline. [`worker::WorkerHost`] is the other half: it
//! resolves the same bootstrap mapping and dispatches inbound requests
//! to registered handlers.
//!
//! # Example
//! ```no_run
//! use cap_invoke::{Client, ClientBuilder};
//!
//! # async fn run() -> cap_invoke::Result<()> {
//! let config = ClientBuilder::new()
//!     .with_nats_url("nats://127.0.0.1:4222")
//!     .with_tenant_id("acme")
//!     .build();
//! let client = Client::connect(config, None, vec![]).await?;
//! let result = client
//!     .invoke("billing/invoices", "create", serde_json::json!({"amount": 100}), None)
//!     .await;
//! assert!(result.is_ok());
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod policy;
pub mod pool;
pub mod resolution;
pub mod telemetry;
pub mod transport;
mod wire;
pub mod worker;

pub type Result<T> = std::result::Result<T, error::Error>;

pub use client::Client;
pub use config::{ClientBuilder, ClientConfig, WorkerConfig, WorkerHostBuilder, WorkerPoolConfig};
pub use envelope::{InvocationContext, InvocationEnvelope, InvocationMeta, InvocationResult, ResolvedCapability};
pub use error::{CapabilityError, Code, Error};
pub use pipeline::Middleware;
pub use worker::{CapabilityHandler, WorkerHost};
