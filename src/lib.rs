// src/lib.rs — Library root for AgentForge

pub mod cli;
pub mod core;
pub mod infra;
pub mod provider;
pub mod store;
pub mod tools;
pub mod util;
pub mod workspace;
