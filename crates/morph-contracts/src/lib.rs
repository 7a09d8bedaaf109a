pub mod artifacts;
pub mod events;
pub mod graph;
pub mod protocol;
pub mod session;
pub mod workflow;
