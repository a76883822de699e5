//! Generic resource pooling.
//!
//! - [`Recyclable`]: reset/dispose capability required from pooled types.
//! - [`ResourcePool`]: bounded pool with a FIFO wait queue.

pub mod resource;
pub mod resource_pool;

pub use resource::{DisposeError, Recyclable};
pub use resource_pool::{Factory, PoolConfig, PoolError, PoolStats, ResourcePool};
