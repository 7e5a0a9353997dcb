//! # Observability & Tracing
//!
//! [`setup_tracing`] installs the subscriber used by the demo binary.
//!
//! ## Configuration
//!
//! Output is compact and hides the module prefix (`with_target(false)`).
//! Levels come from `RUST_LOG`:
//!
//! ```bash
//! # Lifecycle milestones only
//! RUST_LOG=info cargo run
//!
//! # Every supply, insertion and removal
//! RUST_LOG=debug cargo run
//!
//! # Coordinators only
//! RUST_LOG=pipeline_orchestrator::coordinator=debug cargo run
//! ```
//!
//! ## What Gets Traced
//!
//! - **Coordinator lifecycle**: start, activate, modify, close and stop, keyed by `connection`
//! - **Barrier progress**: records created, handlers supplied, supply failures and timeouts
//! - **Pipeline mutations**: stages inserted or removed, reads re-enabled
//! - **Teardown**: every failed delete with its key and handle
//!
//! ## Workflow Trace Example
//!
//! **With `RUST_LOG=info`**:
//!
//! ```text
//! INFO Coordinator started connection=conn-1 anchor=dynamicChannelHandler
//! INFO Activate connection=conn-1 keys=3
//! INFO Barrier complete, inserting connection=conn-1 generation=1 inserting=3
//! INFO Pipeline ready connection=conn-1 generation=1 operation="activate"
//! INFO Modify connection=conn-1 keys=2 removed=1
//! INFO Closing connection=conn-1 records=2 in_flight=0
//! INFO Closed connection=conn-1 failed=0
//! ```
//!
//! Client calls run inside spans (`activate`, `modify`, `close`) so every line
//! they cause carries the connection they were made for.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false) // connection ids identify the source
        .compact()
        .init();
}
