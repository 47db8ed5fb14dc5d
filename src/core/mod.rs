//! Threading primitives: the GL execution queue and the decode pool.

pub mod queue;
pub mod workers;

pub use queue::ExecutionQueue;
pub use workers::Workers;
