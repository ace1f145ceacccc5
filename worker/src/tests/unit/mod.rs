pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod sync_engine;
