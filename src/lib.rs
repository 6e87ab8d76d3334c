//! Agent-execution harness: a model-driven agent runs ML experiments in
//! an isolated sandbox under time and cost ceilings, and every step is
//! recorded to a replayable trajectory.

pub mod actions;
pub mod config;
pub mod episode;
pub mod ledger;
pub mod model;
pub mod runner;
pub mod sandbox;
pub mod trajectory;
