#![doc(html_logo_url = "https://www.rust-lang.org/logos/rust-logo-128x128.png")]
#![doc(html_favicon_url = "https://www.rust-lang.org/favicon.ico")]
//! # Pipeline Orchestrator
//!
//! > **Dynamically provisioned stages for per-connection pipelines.**
//!
//! Every connection owns an ordered pipeline of named stages. Its coordinator
//! is given a *desired set*, an ordered list of `(handler name, provider kind)`
//! keys, and makes the pipeline match it: one configuration record is created
//! per key, the external system answers each record with a stage instance, and
//! once every instance has arrived they are inserted in desired order behind
//! the coordinator's anchor. Reads stay disabled until the pipeline reports the
//! assembly complete.
//!
//! ## 🏗️ Design
//!
//! ### 1. One actor per connection
//! [`coordinator::CoordinatorActor`] owns the desired set, the configuration
//! handles, the pending supplies and the insertion records. Nothing else
//! touches them, so they need no locks. `activate`, `modify` and `close` go
//! through a FIFO and run one at a time.
//!
//! ### 2. Pipeline affinity
//! A pipeline is only mutated on its own task. Everyone else submits jobs via
//! [`pipeline::Affinity`]; a job sent after the connection closed fails with a
//! stale-mutation error instead of touching a dead pipeline.
//!
//! ### 3. Asynchronous supply
//! Records are created on a shared, bounded [`provisioning::WorkerPool`]. The
//! external system answers on the [`supply::SupplyChannel`], routed by
//! connection. Nothing blocks a pipeline task while waiting.
//!
//! ### 4. In-band completion
//! After the last insertion the coordinator appends a one-shot sentinel stage.
//! Its signal travels the pipeline to the anchor, which re-enables reads and
//! resolves the operation, so readiness is observed by the pipeline itself.
//!
//! ### 5. Observability
//! `tracing` everywhere, with the connection id on every line. See
//! [`lifecycle::tracing`].
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Model ([`model`], [`config`], [`error`])
//! - **Key items**: [`Key`](model::Key), [`DesiredSet`](model::DesiredSet),
//!   [`HandlerRecord`](model::HandlerRecord), [`OrchestratorConfig`](config::OrchestratorConfig).
//!
//! ### 2. The Pipeline ([`pipeline`])
//! - **Role**: Ordered stages, read gating and the affinity task.
//! - **Key items**: [`Pipeline`](pipeline::Pipeline), [`Stage`](pipeline::Stage),
//!   [`Connection`](pipeline::Connection).
//!
//! ### 3. The Coordinator ([`coordinator`])
//! - **Role**: The per-connection state machine.
//! - **Key items**: [`CoordinatorClient`](coordinator::CoordinatorClient),
//!   [`LifecycleState`](coordinator::LifecycleState).
//!
//! ### 4. The Edges ([`provisioning`], [`supply`], [`backend`])
//! - **Role**: Talking to the configuration system and receiving its answers.
//!   [`backend`] is an in-memory configuration system for demos and tests;
//!   [`provisioning::mock`] records calls and injects failures.
//!
//! ### 5. The Runtime ([`lifecycle`])
//! - **Role**: Opens connections, wires their coordinators and shuts down.
//! - **Key items**: [`SessionManager`](lifecycle::SessionManager).
//!
//! ## 🚀 Quick Start
//!
//! ```bash
//! # Run the demo with info logs
//! RUST_LOG=info cargo run
//!
//! # With a configuration file
//! RUST_LOG=debug cargo run -- orchestrator.toml
//!
//! cargo test
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod provisioning;
pub mod supply;
