//! Core domain types and logic.

pub mod entity;
pub mod state_machine;
pub mod ownership;
pub mod admin;
pub mod clock;
pub mod settings;
pub mod config_validation;
pub mod service;
pub mod error;
