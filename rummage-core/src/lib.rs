pub mod graph;
pub mod robots;
pub mod traverse;

pub use graph::{
    FactUpdate, GraphError, GraphLink, GraphNode, GraphSnapshot, GraphStore, SearchMatches,
};
pub use robots::RobotsRules;
pub use traverse::{PageFailure, TraversalConfig, TraversalResult, TraverseError, Traverser};
