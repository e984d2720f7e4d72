//! Persistence layer for corral.
//!
//! Provides the SQLite connection pool, schema setup, row models, and query
//! functions for the lifecycle entities: projects, tasks, agents, sessions,
//! worktrees, sandbox instances, API keys, and audit logs.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
