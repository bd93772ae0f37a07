//! Binding to the network-allocation service.
//!
//! Per-app IP allocations are acquired at spool time and reclaimed by
//! the GC pass when a container died without releasing its allocation.

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One IP allocation held by a box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Allocation id inside the service.
    pub id: String,
    /// Network the allocation belongs to.
    pub net_id: String,
    /// Assigned address.
    pub ip: String,
    /// Name of the box the allocation is marked used by.
    pub box_name: String,
}

/// Interface to the allocation service.
#[async_trait]
pub trait NetAllocator: Send + Sync {
    /// Acquires allocations for the app being spooled. Failure is fatal
    /// to the spool.
    async fn bind_allocs(&self, token: &CancellationToken, net_id: &str) -> Result<()>;

    /// Returns all allocations currently marked used by this box,
    /// together with a diagnostic stat string.
    async fn used_allocations(
        &self,
        token: &CancellationToken,
    ) -> Result<(Vec<Allocation>, String)>;

    /// Releases one allocation, recording why.
    async fn unuse_alloc(
        &self,
        token: &CancellationToken,
        net_id: &str,
        id: &str,
        reason: &str,
    ) -> Result<()>;

    /// Releases any service handle (e.g. a database connection).
    async fn close(&self) {}
}

/// Allocator for embeddings without a network-allocation service; binds
/// nothing and reports no used allocations.
pub struct NoopAllocator;

#[async_trait]
impl NetAllocator for NoopAllocator {
    async fn bind_allocs(&self, _token: &CancellationToken, _net_id: &str) -> Result<()> {
        Ok(())
    }

    async fn used_allocations(
        &self,
        _token: &CancellationToken,
    ) -> Result<(Vec<Allocation>, String)> {
        Ok((Vec::new(), String::from("noop")))
    }

    async fn unuse_alloc(
        &self,
        _token: &CancellationToken,
        _net_id: &str,
        _id: &str,
        _reason: &str,
    ) -> Result<()> {
        Ok(())
    }
}
