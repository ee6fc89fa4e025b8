mod record;
mod extract;
mod graph;

pub use record::{DataReference, MemoryRef, Param, Params, RecordStatus, TaskRecord};
pub use extract::{
    synthetic_node_id, DataKind, DataResolver, DependencyExtractor, DependencyNode, DependencySet,
    ExternalInputNode, ExtractionMode, InputBinding, InputSource, ProducedOutputNode, ResolvedData,
    TaskNode,
};
pub use graph::{DependencyGraph, Edge, GraphState};
