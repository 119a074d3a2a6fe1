//! Core library for docpub: plans and executes the publication of a
//! draft documentation hierarchy into its published location.

pub mod batch;
pub mod config;
pub mod diff;
pub mod fsstore;
pub mod model;
pub mod queue;
pub mod remote;
pub mod runtime;
pub mod task;
pub mod tree;
