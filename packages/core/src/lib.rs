// Library root: exposes the pipeline for the `calendar` binary and for
// integration tests in `tests/`.

pub mod catalog;
pub mod consumer;
pub mod db;
pub mod error;
pub mod event;
pub mod queue;
pub mod scheduler;
pub mod storage;

// Process wiring used by the binary.
pub mod cli;
pub mod config;
pub mod logging;
