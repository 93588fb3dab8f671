//! Settle Core
//!
//! Core library for driving cloud resources through their lifecycle and
//! waiting for them to settle in a target state

pub mod config;
pub mod effect;
pub mod interpreter;
pub mod plan;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod source_details;
pub mod sweeper;
pub mod waiter;

pub use waiter::{
    FetchError, PollSchedule, WaitError, WaitReport, WaitSpec, WaitSpecBuilder, WaitSpecError,
    wait_for_state,
};
