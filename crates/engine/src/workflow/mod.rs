//! Workflow-level orchestration beyond the sequential driver.

pub mod runner;
