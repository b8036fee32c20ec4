//! Coordination-service boundary: ephemeral registration, compare-and-set
//! address publication, and watch/notify semantics.
//!
//! The consensus machinery behind these primitives is a black box to the
//! master; everything it needs is expressed by the `Coordinator` trait. A
//! watch is a one-shot notification channel that must be explicitly re-armed
//! after it fires. `MemoryCoordinator` is the in-process implementation used
//! by tests and single-binary deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::registry::ServerName;

/// One-shot notification for a watched registration. Resolves when the
/// registration disappears (or immediately if it was already gone when the
/// watch was installed).
pub struct Watch {
    rx: oneshot::Receiver<()>,
}

impl Watch {
    pub fn new(rx: oneshot::Receiver<()>) -> Self {
        Watch { rx }
    }

    /// Already-fired watch, for registrations observed absent at install
    /// time.
    pub fn fired_already() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Watch { rx }
    }

    /// Wait for the watch to fire. A dropped coordination service counts as
    /// a fire: the registration is unobservable either way.
    pub async fn fired(self) {
        let _ = self.rx.await;
    }
}

/// Black-box coordination primitive ("the Paxos wrapper").
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Publish `addr` as the active master iff no master is registered.
    /// Returns false when another registration already holds the slot.
    async fn try_claim_master(&self, addr: &str) -> Result<bool>;

    async fn current_master(&self) -> Result<Option<String>>;

    /// Remove our own master registration (graceful resignation).
    async fn resign_master(&self, addr: &str) -> Result<()>;

    /// Watch for the master registration to disappear. Losing election
    /// candidates block on this before retrying; the sitting leader uses it
    /// to detect session loss.
    async fn watch_master_vacancy(&self) -> Result<Watch>;

    /// Create the cluster-state marker (existence = cluster up).
    async fn set_cluster_up(&self) -> Result<()>;

    async fn cluster_is_up(&self) -> Result<bool>;

    /// Flag a cluster-wide shutdown and remove the cluster-state marker.
    async fn request_shutdown(&self) -> Result<()>;

    async fn shutdown_requested(&self) -> Result<bool>;

    /// Ephemeral per-server registration.
    async fn register_server(&self, name: &ServerName) -> Result<()>;

    /// Remove a server registration and fire its watches. Used both for
    /// expiring a stale pre-empted process and for clean deregistration.
    async fn expire_server(&self, name: &ServerName) -> Result<()>;

    /// Watch one server's ephemeral registration for expiry.
    async fn watch_server(&self, name: &ServerName) -> Result<Watch>;

    /// All currently registered servers; the failover-join path uses this to
    /// reconstruct a running cluster's membership.
    async fn registered_servers(&self) -> Result<Vec<ServerName>>;
}

#[derive(Default)]
struct CoordInner {
    master: Option<String>,
    cluster_up: bool,
    shutdown: bool,
    servers: Vec<ServerName>,
    master_watchers: Vec<oneshot::Sender<()>>,
    server_watchers: HashMap<ServerName, Vec<oneshot::Sender<()>>>,
}

/// In-memory coordination service.
#[derive(Default)]
pub struct MemoryCoordinator {
    inner: Mutex<CoordInner>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        MemoryCoordinator::default()
    }

    /// Test hook: drop the master registration as if its session expired.
    pub fn delete_master(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.master = None;
        for tx in inner.master_watchers.drain(..) {
            let _ = tx.send(());
        }
    }

    fn expire_locked(inner: &mut CoordInner, name: &ServerName) {
        inner.servers.retain(|s| s != name);
        if let Some(watchers) = inner.server_watchers.remove(name) {
            for tx in watchers {
                let _ = tx.send(());
            }
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn try_claim_master(&self, addr: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.master.is_some() {
            return Ok(false);
        }
        inner.master = Some(addr.to_string());
        Ok(true)
    }

    async fn current_master(&self) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().master.clone())
    }

    async fn resign_master(&self, addr: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.master.as_deref() == Some(addr) {
            inner.master = None;
            for tx in inner.master_watchers.drain(..) {
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    async fn watch_master_vacancy(&self) -> Result<Watch> {
        let mut inner = self.inner.lock().unwrap();
        if inner.master.is_none() {
            return Ok(Watch::fired_already());
        }
        let (tx, rx) = oneshot::channel();
        inner.master_watchers.push(tx);
        Ok(Watch::new(rx))
    }

    async fn set_cluster_up(&self) -> Result<()> {
        self.inner.lock().unwrap().cluster_up = true;
        Ok(())
    }

    async fn cluster_is_up(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().cluster_up)
    }

    async fn request_shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        inner.cluster_up = false;
        Ok(())
    }

    async fn shutdown_requested(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().shutdown)
    }

    async fn register_server(&self, name: &ServerName) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.servers.contains(name) {
            inner.servers.push(name.clone());
        }
        Ok(())
    }

    async fn expire_server(&self, name: &ServerName) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::expire_locked(&mut inner, name);
        Ok(())
    }

    async fn watch_server(&self, name: &ServerName) -> Result<Watch> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.servers.contains(name) {
            return Ok(Watch::fired_already());
        }
        let (tx, rx) = oneshot::channel();
        inner.server_watchers.entry(name.clone()).or_default().push(tx);
        Ok(Watch::new(rx))
    }

    async fn registered_servers(&self) -> Result<Vec<ServerName>> {
        Ok(self.inner.lock().unwrap().servers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server(n: u64) -> ServerName {
        ServerName::new(format!("10.0.0.{n}:7200"), 100 + n)
    }

    #[tokio::test]
    async fn master_claim_is_compare_and_set() {
        let coord = MemoryCoordinator::new();
        assert!(coord.try_claim_master("m1:6000").await.unwrap());
        assert!(!coord.try_claim_master("m2:6000").await.unwrap());
        coord.resign_master("m1:6000").await.unwrap();
        assert!(coord.try_claim_master("m2:6000").await.unwrap());
    }

    #[tokio::test]
    async fn vacancy_watch_fires_on_resignation() {
        let coord = MemoryCoordinator::new();
        assert!(coord.try_claim_master("m1:6000").await.unwrap());
        let watch = coord.watch_master_vacancy().await.unwrap();
        coord.resign_master("m1:6000").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), watch.fired())
            .await
            .expect("watch should fire");
    }

    #[tokio::test]
    async fn server_watch_fires_on_expiry_and_is_armed_per_install() {
        let coord = MemoryCoordinator::new();
        let name = server(1);
        coord.register_server(&name).await.unwrap();
        let watch = coord.watch_server(&name).await.unwrap();
        coord.expire_server(&name).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), watch.fired())
            .await
            .expect("watch should fire");

        // A watch installed after expiry fires immediately.
        let late = coord.watch_server(&name).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), late.fired())
            .await
            .expect("late watch should fire");
    }
}
