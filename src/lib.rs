//! Incremental monitoring and alerting for care coordination.
//!
//! A [`poller::Poller`] periodically asks the [`scanner`] for patients with
//! recent clinical records, and the [`evaluator::Evaluator`] re-analyzes only
//! those whose records changed since their stored [`checkpoint`]. New
//! findings pass through [`dedup`] before becoming alerts, and each new
//! alert gets a best-effort [`recommendation`].

pub mod activity;
pub mod analysis;
pub mod blob;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod evaluator;
pub mod llm;
pub mod memory;
pub mod models;
pub mod poller;
pub mod recommendation;
pub mod report;
pub mod scanner;
pub mod store;
