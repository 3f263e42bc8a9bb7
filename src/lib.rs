//! bankgen: turn study documents into AI-generated question banks.
//!
//! The pipeline takes an uploaded PDF or Word document, extracts and cleans
//! its text, splits it into overlapping chunks, asks an AI provider for
//! practice questions per chunk, and persists the resulting bank to SQLite
//! in one transaction. Progress is observable while the task runs.
//!
//! Module map:
//!
//! - [`config`]: TOML configuration with validation
//! - [`models`]: tasks, chunks, questions, banks, progress events
//! - [`error`]: pipeline and provider error taxonomy
//! - [`extract`]: PDF and Word text extraction
//! - [`normalize`]: text cleaning and chunking strategies
//! - [`generate`]: AI provider, validation, retry with backoff
//! - [`progress`]: in-memory per-task progress logs
//! - [`task`]: the coordinator running the staged pipeline
//! - [`db`], [`migrate`], [`store`]: SQLite persistence
//! - [`report`]: CLI progress rendering

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod generate;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod report;
pub mod store;
pub mod task;
