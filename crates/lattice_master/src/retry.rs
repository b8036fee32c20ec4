//! Bounded-retry access to catalog regions.
//!
//! Every attempt re-resolves which server currently hosts the target region,
//! so a catalog region that moved mid-call is picked up transparently.
//! Structural errors propagate immediately; transport failures retry with a
//! fixed inter-attempt sleep; exhaustion surfaces the full attempt history.
//! A master that starts shutting down mid-retry abandons with no result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::assignment::AssignmentState;
use crate::catalog::{CatalogRegionRef, RegionDescriptor, RowCells};
use crate::connection::{RegionServerClient, ServerConnector};
use crate::error::{MasterError, Result};

/// Which catalog region a call is aimed at. Resolution happens per attempt.
#[derive(Debug, Clone)]
pub enum CatalogTarget {
    /// The singleton root region.
    Root,
    /// The meta region whose key range covers this catalog row key.
    MetaRowOf(Vec<u8>),
    /// A specific meta region by name.
    Meta(String),
}

pub struct CatalogAccess {
    connector: Arc<dyn ServerConnector>,
    assignment: Arc<AssignmentState>,
    retries: u32,
    retry_sleep: Duration,
    closed: Arc<AtomicBool>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CatalogAccess {
    pub fn new(
        connector: Arc<dyn ServerConnector>,
        assignment: Arc<AssignmentState>,
        retries: u32,
        retry_sleep: Duration,
        closed: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(CatalogAccess {
            connector,
            assignment,
            retries,
            retry_sleep,
            closed,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn resolve(&self, target: &CatalogTarget) -> Result<CatalogRegionRef> {
        match target {
            CatalogTarget::Root => self
                .assignment
                .root_location()
                .map(|server| CatalogRegionRef {
                    region: RegionDescriptor::root(),
                    server: server.addr,
                })
                .ok_or(MasterError::CatalogOffline),
            CatalogTarget::MetaRowOf(row) => self
                .assignment
                .meta_for_row(row)
                .ok_or(MasterError::CatalogOffline),
            CatalogTarget::Meta(name) => self
                .assignment
                .online_metas()
                .into_iter()
                .find(|m| m.region.name() == *name)
                .ok_or(MasterError::CatalogOffline),
        }
    }

    /// Serialize writers to one catalog region's underlying store. This is
    /// the only lock in the master held across network calls.
    pub async fn write_guard(&self, region: &RegionDescriptor) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_locks.lock().unwrap();
            locks
                .entry(region.encoded_name())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Run one retryable call unit. `Ok(None)` means the master began
    /// shutting down and the call was abandoned without a result.
    pub async fn call<T, F>(&self, target: &CatalogTarget, what: &str, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RegionServerClient>, CatalogRegionRef) -> BoxFuture<'static, Result<T>>,
    {
        let mut history: Vec<String> = Vec::new();
        let attempts = self.retries as usize + 1;
        for attempt in 0..attempts {
            if self.closed.load(Ordering::SeqCst) {
                tracing::debug!(what, "abandoning catalog call, master shutting down");
                return Ok(None);
            }
            let outcome = match self.resolve(target) {
                Ok(region_ref) => match self.connector.connect(&region_ref.server) {
                    Ok(client) => f(client, region_ref).await,
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            match outcome {
                Ok(value) => return Ok(Some(value)),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    tracing::debug!(what, attempt, error = %err, "catalog call attempt failed");
                    history.push(err.to_string());
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.retry_sleep).await;
            }
        }
        Err(MasterError::RetriesExhausted {
            attempts,
            last: history.last().cloned().unwrap_or_default(),
            history,
        })
    }

    pub async fn get_row(
        &self,
        target: &CatalogTarget,
        row: &[u8],
    ) -> Result<Option<Option<RowCells>>> {
        let row = row.to_vec();
        self.call(target, "get row", move |client, region_ref| {
            let row = row.clone();
            Box::pin(async move { client.get_row(&region_ref.region.encoded_name(), &row).await })
        })
        .await
    }

    pub async fn put_cells(
        &self,
        target: &CatalogTarget,
        row: &[u8],
        cells: Vec<(String, Bytes)>,
    ) -> Result<Option<()>> {
        let row = row.to_vec();
        self.call(target, "put cells", move |client, region_ref| {
            let row = row.clone();
            let cells = cells.clone();
            Box::pin(async move {
                client
                    .put_cells(&region_ref.region.encoded_name(), &row, cells)
                    .await
            })
        })
        .await
    }

    pub async fn delete_cells(
        &self,
        target: &CatalogTarget,
        row: &[u8],
        columns: Vec<String>,
    ) -> Result<Option<()>> {
        let row = row.to_vec();
        self.call(target, "delete cells", move |client, region_ref| {
            let row = row.clone();
            let columns = columns.clone();
            Box::pin(async move {
                client
                    .delete_cells(&region_ref.region.encoded_name(), &row, columns)
                    .await
            })
        })
        .await
    }

    pub async fn delete_row(&self, target: &CatalogTarget, row: &[u8]) -> Result<Option<()>> {
        let row = row.to_vec();
        self.call(target, "delete row", move |client, region_ref| {
            let row = row.clone();
            Box::pin(async move {
                client
                    .delete_row(&region_ref.region.encoded_name(), &row)
                    .await
            })
        })
        .await
    }

    /// Stream every row from `start_row` to the end of the region as one
    /// retryable unit.
    pub async fn scan_rows(
        &self,
        target: &CatalogTarget,
        start_row: &[u8],
    ) -> Result<Option<Vec<(Vec<u8>, RowCells)>>> {
        let start = start_row.to_vec();
        self.call(target, "scan rows", move |client, region_ref| {
            let start = start.clone();
            Box::pin(async move {
                let region = region_ref.region.encoded_name();
                let scanner = client.open_scanner(&region, &start).await?;
                let mut rows = Vec::new();
                loop {
                    match client.scanner_next(scanner).await {
                        Ok(Some(row)) => rows.push(row),
                        Ok(None) => break,
                        Err(err) => {
                            let _ = client.close_scanner(scanner).await;
                            return Err(err);
                        }
                    }
                }
                client.close_scanner(scanner).await?;
                Ok(rows)
            })
        })
        .await
    }
}
