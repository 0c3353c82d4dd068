//! Broker-backed event bus implementations.
//!
//! The bus abstraction and the in-memory queue live in `clinicflow-events`.
//! This module adds Redis Streams behind the `redis` feature.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsEventBus};
