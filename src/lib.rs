//! estuary — feed ingestion and change-detection engine.
//!
//! Polls RSS, Atom, JSON and plain-HTML sources on per-feed schedules,
//! detects changes with cheap fingerprints before parsing, deduplicates
//! discovered posts through a TTL cache with interchangeable backends, and
//! escalates bot-blocked fetches to a bounded pool of headless rendering
//! contexts.

pub mod app;
pub mod browser;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod orchestrator;
pub mod processor;
pub mod sink;
