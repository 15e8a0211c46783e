//! HTTP handlers for thumbforge-api.

pub mod health;
pub mod jobs;
