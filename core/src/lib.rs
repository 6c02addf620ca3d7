//! Simulation lifecycle service for product-formulation briefs.
//!
//! A brief is admitted against a daily quota, stored, dispatched to an
//! external workflow engine and finished by signed webhook callbacks.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod metrics;
pub mod quota;
pub mod reconciler;
pub mod signature;
pub mod simulation;
pub mod store;
pub mod types;
