pub mod config;
pub mod driver;
pub mod error;
pub mod fabric;
mod pipeline;
pub mod reduce;
pub mod schedule;
pub mod sync;
pub mod topology;
pub mod types;

pub use config::AllReduceConfig;
pub use driver::AllReduce;
pub use error::{MeshredError, Result};
pub use schedule::{BlockRun, BlockSet, NodeSchedule, Phase, SegmentPlan, StepPlan};
pub use topology::{partner_and_direction, PeerLink, Torus};
pub use types::{AlgorithmKind, DataType, NodeId, ReduceOp, Role, Variant};
