//! Per-connection pipeline coordinator.
//!
//! [`new`] returns the actor and its [`CoordinatorClient`]. The actor is
//! started with a [`CoordinatorContext`] naming the connection's affinity,
//! the provisioning client, the shared worker pool and the supply channel.

pub mod actor;
pub mod client;
pub mod message;
pub mod sentinel;
pub mod state;

pub use actor::{new, CoordinatorActor, CoordinatorContext};
pub use client::CoordinatorClient;
pub use message::{CoordinatorRequest, Ready};
pub use sentinel::SENTINEL_NAME;
pub use state::{CoordinatorSnapshot, LifecycleState, PendingSupply};
