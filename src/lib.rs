//! Taskloom - Persistence and state-coordination engine for multi-agent task orchestration

pub mod cli;
pub mod core;
pub mod db;
pub mod error;
