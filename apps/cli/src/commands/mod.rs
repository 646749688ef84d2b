//! Command implementations for the Roadseg CLI.

pub mod evaluate;
pub mod predict;
pub mod setup;
pub mod train;
