//! Port traits the domain depends on.

pub mod store_port;
pub mod executor_port;
pub mod observer_port;
pub mod config_port;
