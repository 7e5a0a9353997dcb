//! Per-connection pipeline: stages, the ordered chain, and the serial task
//! that owns it.

pub mod affinity;
pub mod connection;
pub mod chain;
pub mod stage;

pub use self::affinity::{Affinity, AffinityLoop};
pub use self::connection::Connection;
pub use self::chain::{Pipeline, TAIL_NAME};
pub use self::stage::{PipelineEvent, Stage, StageContext, StageRef, TagStage};
