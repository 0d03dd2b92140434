//! Runtime: the dispatch loops
//!
//! - Flow execution interface and hot-swappable engine registry
//! - Flow processor polling the processing queue into a bounded worker pool
//! - Message handler loops, one per registered handler
//! - Loop handles with bounded, cooperative shutdown

// FlowEngine trait, FlowOutput and the arc-swap registry
pub mod engine;

// Start/stop lifecycle shared by both loops
pub mod handle;

// Lease-and-invoke loop for message handlers
pub mod handler_loop;

// Flow processing dispatch loop and worker pool
pub mod processor;

pub use engine::{FlowEngine, FlowOutput, FlowRegistry};
pub use handle::{LoopHandle, TRACING_TARGET_DISPATCH};
pub use handler_loop::{HandlerLoopOptions, MessageHandlerLoop};
pub use processor::{FlowProcessor, ProcessorOptions};
