//! In-process per-scope serialization

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::Scope;

/// One async mutex per scope
///
/// Runs for the same scope queue up behind each other; runs for different
/// scopes never contend.
#[derive(Debug, Clone, Default)]
pub struct ScopeLocks {
    inner: Arc<Mutex<HashMap<Scope, Arc<AsyncMutex<()>>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `scope`
    pub async fn lock(&self, scope: &Scope) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(scope.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_scope_is_exclusive() {
        let locks = ScopeLocks::new();
        let scope = Scope::new("us-west-2", "EC2");

        let guard = locks.lock(&scope).await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            locks.lock(&scope),
        )
        .await;
        assert!(pending.is_err(), "second lock should wait");

        drop(guard);
        let _again = locks.lock(&scope).await;
    }

    #[tokio::test]
    async fn test_different_scopes_are_independent() {
        let locks = ScopeLocks::new();
        let _a = locks.lock(&Scope::new("us-west-2", "EC2")).await;
        let _b = locks.lock(&Scope::new("eu-west-1", "S3")).await;
    }
}
