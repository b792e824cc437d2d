// src/core/mod.rs — Routing, caching, patch checks and the execution loop

pub mod approval;
pub mod budget;
pub mod cache;
pub mod cancel;
pub mod cost;
pub mod engine;
pub mod patch;
pub mod plan;
pub mod recovery;
pub mod router;
pub mod task;
pub mod transitions;
pub mod types;
