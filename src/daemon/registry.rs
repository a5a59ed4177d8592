use std::sync::Arc;
use tokio::sync::watch;
use tracing::{trace, warn};

/// Counts in-flight long-running services so shutdown can wait for all of
/// them. Clones share the same counter.
#[derive(Clone)]
pub struct ServiceRegistry {
    active: Arc<watch::Sender<usize>>,
}

/// Registration token. Unregisters when dropped, so every exit path of a
/// service loop releases it.
#[must_use = "dropping the handle unregisters the service immediately"]
pub struct ServiceHandle {
    registry: ServiceRegistry,
    name: &'static str,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self {
            active: Arc::new(tx),
        }
    }

    pub fn register(&self, name: &'static str) -> ServiceHandle {
        self.active.send_modify(|n| *n += 1);
        trace!(service = name, active = self.active_count(), "Service registered");
        ServiceHandle {
            registry: self.clone(),
            name,
        }
    }

    fn unregister(&self, name: &'static str) {
        self.active.send_modify(|n| {
            if *n == 0 {
                warn!(service = name, "Unregister without matching register");
            } else {
                *n -= 1;
            }
        });
        trace!(service = name, active = self.active_count(), "Service unregistered");
    }

    pub fn active_count(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolve once every registered service has unregistered.
    pub async fn wait(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let registry = ServiceRegistry::new();
        tokio::time::timeout(Duration::from_millis(100), registry.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_unregistered() {
        let registry = ServiceRegistry::new();
        let mut handles: Vec<_> = (0..3).map(|_| registry.register("test")).collect();
        assert_eq!(registry.active_count(), 3);

        handles.pop();
        handles.pop();
        assert_eq!(registry.active_count(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), registry.wait())
                .await
                .is_err(),
            "wait must block while one service is still registered"
        );

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait().await })
        };
        drop(handles);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_released_from_spawned_task() {
        let registry = ServiceRegistry::new();
        let handle = registry.register("worker");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(handle);
        });
        tokio::time::timeout(Duration::from_secs(1), registry.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_isolated_registries() {
        let a = ServiceRegistry::new();
        let b = ServiceRegistry::new();
        let _h = a.register("listener");
        assert_eq!(a.active_count(), 1);
        assert_eq!(b.active_count(), 0);
    }
}
