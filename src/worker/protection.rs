//! Task protection: a deployment-controller capability that keeps a
//! worker instance from being involuntarily terminated while it holds
//! work. The concrete mechanism (e.g. ECS deregistration delay, a k8s
//! pod-disruption-budget annotation) is deployment-specific and out of
//! this substrate's scope; callers inject an implementation.

use async_trait::async_trait;
use tracing::debug;

use crate::Result;

#[async_trait]
pub trait TaskProtection: Send + Sync {
    async fn acquire(&self) -> Result<()>;
    async fn release(&self) -> Result<()>;
}

/// Default implementation for environments with no deployment controller
/// to call back into (local runs, tests).
pub struct NoOpProtection;

#[async_trait]
impl TaskProtection for NoOpProtection {
    async fn acquire(&self) -> Result<()> {
        debug!("task protection acquire (no-op)");
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        debug!("task protection release (no-op)");
        Ok(())
    }
}
