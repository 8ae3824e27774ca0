pub mod aggregate;
pub mod scheduler;
pub mod stage;
