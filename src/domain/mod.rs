//! Core domain types for the clearance workflow.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Units and the unit catalog
//! - Requesters, verifiers and roles
//! - The request aggregate and its status projection
//! - Stage typestate machine

pub mod principal;
pub mod request;
pub mod stage;
pub mod unit;
