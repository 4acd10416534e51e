extern crate self as atomflow;

pub mod atom;
pub mod cache;
pub mod config;
pub mod directive;
pub mod error;
pub mod graph;
pub mod lift;
pub mod payload;
pub mod render;
pub mod state;
#[cfg(feature = "async")]
pub mod sync;
pub mod tracking;
pub mod value;
pub mod workflow;

pub use atom::{Atom, AtomFn, AtomResult, AtomStatus, RetryPolicy};
pub use cache::{AtomCache, InputHash, compute_input_hash};
pub use config::{DirectiveConfig, EngineConfig, RetrySettings};
pub use directive::{DirectiveRegistry, DirectiveSpec, Renderer};
pub use error::{FlowError, GraphError, Result, TransportError};
pub use graph::DependencyGraph;
pub use lift::{FunctionTable, LiftOptions, LiftedProgram, transform};
pub use payload::{ComponentBatch, PayloadLimits};
pub use render::{Callsite, Component, RenderBuffer, RenderDecision, component_id};
pub use state::ComponentState;
pub use tracking::{DependencyTracker, DynamicEdges, TrackedValue};
pub use value::AtomValue;
pub use workflow::{AtomContext, ExecutionOutcome, Workflow, WorkflowContext};

pub use atomflow_macros::atom;
