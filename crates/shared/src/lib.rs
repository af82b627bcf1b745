//! Shiftwise Shared Types and Utilities
//!
//! This crate contains the plan vocabulary and database utilities shared
//! across the Shiftwise platform.

pub mod db;
pub mod plans;

pub use db::*;
pub use plans::*;
