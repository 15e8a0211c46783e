//! # thumbforge-core
//!
//! Core types, traits, and abstractions for the thumbforge thumbnail pipeline.
//!
//! This crate provides the job data model, the repository and queue traits the
//! producer and worker are written against, and the shared error type. Concrete
//! backends live in `thumbforge-db` and `thumbforge-queue`.

pub mod config;
pub mod defaults;
pub mod error;
pub mod file_safety;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use file_safety::{detect_content_type, is_image_mime, sanitize_filename, staged_filename};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{extract_timestamp, new_v7};
