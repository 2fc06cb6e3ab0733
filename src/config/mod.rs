//! # baselock Configuration Module
//!
//! This module centralizes the tunable constants of the lock manager. Values
//! that interact (the recheck interval and the builder's lower bound, the
//! inline queue capacities) live side by side so a change to one is made
//! with the others in view.
//!
//! ## Module Organization
//!
//! - [`constants`]: Timing, lifecycle and capacity constants

pub mod constants;
pub use constants::*;
