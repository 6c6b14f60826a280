//! Concrete adapter implementations for ports.

pub mod memory_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod fault_hook;
pub mod local_executor;
pub mod file_config_adapter;
