pub mod queue_manager;
pub mod scheduler;
