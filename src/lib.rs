//! Popularity enrichment for motorcycle catalogs.
//!
//! Reads a catalog of models, looks each one up on a search-trends provider,
//! splits the national score across French regions and keeps a checkpoint so
//! an interrupted run picks up where it stopped.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod enrichment;
pub mod output;
pub mod regions;
pub mod trends;
