//! The three container-decomposition engines the Pipeline Coordinator
//! dispatches to by [`crate::detect::Route`].

pub mod firmware;
pub mod partition;
pub mod super_engine;
