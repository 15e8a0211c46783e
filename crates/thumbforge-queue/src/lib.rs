//! # thumbforge-queue
//!
//! Durable job queue for the thumbnail pipeline.
//!
//! This crate provides:
//! - [`RedisStreamQueue`]: Redis Streams adapter with consumer groups, manual
//!   acknowledgment, dead-lettering, and stale-delivery reclaim
//! - [`InMemoryQueue`]: in-process queue with the same contract
//! - [`consume`]: the pump that drives a [`DeliveryHandler`] over a queue

pub mod memory;
pub mod pump;
pub mod redis_stream;

pub use memory::InMemoryQueue;
pub use pump::{consume, consume_with_options, DeliveryHandler, PumpOptions, PumpStats};
pub use redis_stream::{dead_letter_key, RedisQueueConfig, RedisStreamQueue};

pub use thumbforge_core::{Delivery, MessageQueue, Outcome};
