//! Run lifecycle management.
//!
//! - [`StatusStateMachine`]: single-run transitions (register, enable, disable,
//!   canary) with their serving side effects
//! - [`Rebalancer`]: weight-map driven traffic splits over a whole scope

pub mod rebalancer;
pub mod state_machine;

pub use rebalancer::{normalize_fractions, RebalanceMode, RebalanceReport, Rebalancer, RunOutcome};
pub use state_machine::StatusStateMachine;
