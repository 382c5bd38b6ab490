//! Pipeline specifications and their instantiation
//!
//! A [`PipelineSpec`] is the wire form of a candidate: an ordered list of
//! [`ObjectSpec`] constructor calls. [`PipelineSpec::instantiate`] resolves
//! each object through the [`ComponentRegistry`] and assembles a [`Chain`].

mod chain;
mod instantiate;
mod params;
pub mod registry;
mod spec;

pub use chain::{Chain, Container, Pipeline, Step, StepKind, STREAMING_BATCH_ROWS};
pub use instantiate::InstantiateContext;
pub use params::Params;
pub use registry::{Builder, ComponentEntry, ComponentRegistry, EnsembleKind};
pub use spec::{ObjectSpec, PipelineSpec, SpecClass};
