//! Analysis of captured stacks
//!
//! Pure aggregation logic, separated from capture and from the monitor
//! threads that drive it.

pub mod call_tree;

pub use call_tree::{
    build_forest, AddressFrameNode, CallTreeAggregator, CallTreeHandle, Forest, WeightedStack,
    ASYNC_BOUNDARY_LABEL,
};
