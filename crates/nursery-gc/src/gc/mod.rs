//! The minor collector.
//!
//! - [`minor`]: the per-cycle orchestrator
//! - [`tenure`]: promotion of single cells and the promote-and-rewrite tracer
//! - [`worklist`]: forwarding side tables and the promotion queue
//! - [`sizing`]: adaptive nursery sizing
//! - [`pretenure`]: per-type promotion sampling

pub mod minor;
pub mod pretenure;
pub mod sizing;
pub mod tenure;
pub mod worklist;

pub use minor::CollectReason;
pub use pretenure::PretenureSampler;
pub use tenure::{CycleStats, MinorTracer, SlotKind};
pub use worklist::ForwardingLedger;
