//! Report rendering.
//!
//! Turns the structured tool arguments produced by the models into the
//! human-readable text stored on tasks and case history.

pub mod generator;

pub use generator::*;
