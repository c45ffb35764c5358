//! Ralph transitions: asset lifecycle workflows made of ordered actions,
//! run synchronously or as resumable asynchronous jobs.

pub mod actions;
pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod models;
pub mod ordering;
pub mod runner;
pub mod store;
pub mod ui;
pub mod worker;

pub use engine::{TransitionEngine, TransitionOutcome, TransitionRef, TransitionRun};
pub use error::{ActionError, TransitionError};
pub use runner::{RunOutcome, TransitionRunner};
pub use store::Store;
pub use worker::Worker;
