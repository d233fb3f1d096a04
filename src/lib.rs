//! Client-side cache and sync layer for remotely stored entities.

pub mod backend;
pub mod cache;
pub mod config;
pub mod identity;
pub mod query;
pub mod realtime;
