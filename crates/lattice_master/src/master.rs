//! The master node: leader election, catalog bootstrap, failover join, the
//! operation drain loop, background chores, heartbeat endpoints and DDL
//! entry points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;

use crate::assignment::AssignmentState;
use crate::catalog::{
    self, CatalogRegionRef, ColumnFamilyDescriptor, RegionDescriptor, TableName,
};
use crate::connection::ServerConnector;
use crate::coordination::Coordinator;
use crate::error::{MasterError, Result};
use crate::load::ServerLoad;
use crate::operations::{self, OpOutcome, Operation, TableOpKind, TableOperation};
use crate::queue::OperationQueue;
use crate::registry::{
    Instruction, RegionReport, RegistryConfig, ServerName, ServerRegistry, StartupConfig,
};
use crate::retry::{CatalogAccess, CatalogTarget};
use crate::scanner::CatalogScanner;
use crate::storage::TableStorage;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address published to the coordination service on election.
    pub identity: String,
    /// Periodic catalog rescan interval.
    pub rescan_interval: Duration,
    /// Drain-loop wake interval when idle.
    pub wake_interval: Duration,
    /// Delay-queue expiry for requeued operations.
    pub requeue_delay: Duration,
    /// Catalog call retry bound.
    pub retry_count: u32,
    /// Sleep between catalog call attempts.
    pub retry_sleep: Duration,
    /// Minimum live servers before user-table operations run.
    pub min_live_servers: usize,
    /// Cap on retired logs deleted per cleaner pass.
    pub max_logs_per_cleanup: usize,
    /// Reclaim an unacknowledged assignment after this long.
    pub assignment_timeout: Duration,
    pub registry: RegistryConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            identity: "127.0.0.1:6000".to_string(),
            rescan_interval: Duration::from_secs(60),
            wake_interval: Duration::from_secs(1),
            requeue_delay: Duration::from_secs(2),
            retry_count: 3,
            retry_sleep: Duration::from_secs(2),
            min_live_servers: 1,
            max_logs_per_cleanup: 10,
            assignment_timeout: Duration::from_secs(30),
            registry: RegistryConfig::default(),
        }
    }
}

/// On-demand scan triggers sent by operations when a catalog region comes
/// online.
#[derive(Debug, Clone)]
pub enum ScanRequest {
    Root,
    Meta(CatalogRegionRef),
}

/// Shared handles threaded through operations, scanners and chores.
pub struct MasterServices {
    pub config: MasterConfig,
    pub assignment: Arc<AssignmentState>,
    pub registry: Arc<ServerRegistry>,
    pub catalog: Arc<CatalogAccess>,
    pub storage: Arc<dyn TableStorage>,
    pub queue: Arc<OperationQueue>,
    pub coordinator: Arc<dyn Coordinator>,
    pub connector: Arc<dyn ServerConnector>,
    /// One-way termination flag, checked at loop boundaries.
    pub closed: Arc<AtomicBool>,
    /// Cluster shutdown in progress; heartbeats answer with quiesce.
    pub shutdown_requested: Arc<AtomicBool>,
    /// Two shutdown operations must not split logs concurrently.
    pub log_split_lock: tokio::sync::Mutex<()>,
    /// DDL / catalog-scanner exclusion.
    pub scan_lock: Arc<tokio::sync::Mutex<()>>,
    pub scan_tx: mpsc::UnboundedSender<ScanRequest>,
}

impl MasterServices {
    pub fn build(
        config: MasterConfig,
        coordinator: Arc<dyn Coordinator>,
        connector: Arc<dyn ServerConnector>,
        storage: Arc<dyn TableStorage>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ScanRequest>) {
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let assignment = Arc::new(AssignmentState::new(config.assignment_timeout));
        let queue = OperationQueue::new();
        let catalog = CatalogAccess::new(
            connector.clone(),
            assignment.clone(),
            config.retry_count,
            config.retry_sleep,
            closed.clone(),
        );
        let registry = ServerRegistry::new(
            assignment.clone(),
            queue.clone(),
            coordinator.clone(),
            catalog.clone(),
            config.registry.clone(),
            shutdown_requested.clone(),
        );
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let services = Arc::new(MasterServices {
            config,
            assignment,
            registry,
            catalog,
            storage,
            queue,
            coordinator,
            connector,
            closed,
            shutdown_requested,
            log_split_lock: tokio::sync::Mutex::new(()),
            scan_lock: Arc::new(tokio::sync::Mutex::new(())),
            scan_tx,
        });
        (services, scan_rx)
    }
}

pub struct Master {
    services: Arc<MasterServices>,
    scanner: Arc<CatalogScanner>,
    scan_rx: Mutex<Option<mpsc::UnboundedReceiver<ScanRequest>>>,
}

impl Master {
    pub fn new(
        config: MasterConfig,
        coordinator: Arc<dyn Coordinator>,
        connector: Arc<dyn ServerConnector>,
        storage: Arc<dyn TableStorage>,
    ) -> Arc<Self> {
        let (services, scan_rx) = MasterServices::build(config, coordinator, connector, storage);
        let scanner = CatalogScanner::new(services.clone());
        Arc::new(Master {
            services,
            scanner,
            scan_rx: Mutex::new(Some(scan_rx)),
        })
    }

    pub fn services(&self) -> &Arc<MasterServices> {
        &self.services
    }

    pub fn is_closed(&self) -> bool {
        self.services.closed.load(Ordering::SeqCst)
    }

    /// Begin cluster-wide shutdown: servers quiesce, then the master closes.
    pub async fn shutdown_cluster(&self) {
        tracing::info!("cluster shutdown requested");
        self.services
            .shutdown_requested
            .store(true, Ordering::SeqCst);
        if let Err(err) = self.services.coordinator.request_shutdown().await {
            tracing::warn!(error = %err, "failed to flag shutdown on coordination service");
        }
    }

    // ---- heartbeat RPC surface ----

    pub async fn region_server_startup(&self, name: ServerName) -> Result<StartupConfig> {
        if self.is_closed() {
            return Err(MasterError::ShuttingDown);
        }
        self.services.registry.startup(name).await
    }

    pub async fn region_server_report(
        &self,
        name: ServerName,
        load: ServerLoad,
        messages: Vec<RegionReport>,
        hot_regions: Vec<RegionDescriptor>,
    ) -> Result<Vec<Instruction>> {
        if self.is_closed() {
            return Err(MasterError::ShuttingDown);
        }
        self.services
            .registry
            .report(name, load, messages, hot_regions)
            .await
    }

    // ---- DDL surface ----

    pub async fn create_table(
        &self,
        table: TableName,
        families: Vec<ColumnFamilyDescriptor>,
    ) -> Result<()> {
        if table.is_catalog() {
            return Err(MasterError::InvalidTable(table.0));
        }
        if table.0.is_empty()
            || !table
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(MasterError::InvalidTable(table.0));
        }
        for cf in &families {
            ColumnFamilyDescriptor::validate_name(&cf.name)?;
        }
        self.wait_for_table_ops().await?;

        let _ddl = self.services.scan_lock.clone().lock_owned().await;
        if self.table_has_rows(&table).await? {
            return Err(MasterError::TableExists(table.0));
        }

        let mut region = RegionDescriptor::new(table, Vec::new(), Vec::new(), now_millis());
        if !families.is_empty() {
            region.families = families;
        }
        self.services.storage.create_region(&region)?;
        let target = CatalogTarget::MetaRowOf(region.name_bytes());
        let written = self
            .services
            .catalog
            .put_cells(
                &target,
                &region.name_bytes(),
                catalog::new_region_cells(&region).into_iter().collect(),
            )
            .await?;
        if written.is_none() {
            return Err(MasterError::ShuttingDown);
        }
        tracing::info!(region = %region, "table created");
        self.services.assignment.set_unassigned(region);
        Ok(())
    }

    pub async fn enable_table(&self, table: TableName) -> Result<()> {
        self.run_table_op(table, TableOpKind::Enable).await
    }

    pub async fn disable_table(&self, table: TableName) -> Result<()> {
        self.run_table_op(table, TableOpKind::Disable).await
    }

    pub async fn delete_table(&self, table: TableName) -> Result<()> {
        self.run_table_op(table, TableOpKind::Drop).await
    }

    pub async fn add_column(&self, table: TableName, cf: ColumnFamilyDescriptor) -> Result<()> {
        self.run_table_op(table, TableOpKind::AddColumn(cf)).await
    }

    pub async fn modify_column(&self, table: TableName, cf: ColumnFamilyDescriptor) -> Result<()> {
        self.run_table_op(table, TableOpKind::ModifyColumn(cf)).await
    }

    pub async fn delete_column(&self, table: TableName, family: String) -> Result<()> {
        self.run_table_op(table, TableOpKind::DeleteColumn(family))
            .await
    }

    /// DDL blocks and retries through transient catalog unavailability but
    /// fails fast on structural errors.
    async fn run_table_op(&self, table: TableName, kind: TableOpKind) -> Result<()> {
        let op = TableOperation { table, kind };
        loop {
            if self.is_closed() {
                return Err(MasterError::ShuttingDown);
            }
            let queued = Operation::Table(op.clone());
            if !self.services.queue.allow_operation(&queued) {
                return Ok(());
            }
            match operations::execute(&self.services, queued).await? {
                OpOutcome::Done => {
                    self.services.queue.operation_done(&Operation::Table(op));
                    return Ok(());
                }
                OpOutcome::Requeue { delay, .. } => {
                    tracing::debug!(table = %op.table, "table operation waiting on catalog availability");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn wait_for_table_ops(&self) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(MasterError::ShuttingDown);
            }
            if self.services.assignment.all_metas_scanned()
                && self.services.registry.live_count() >= self.services.config.min_live_servers
            {
                return Ok(());
            }
            tokio::time::sleep(self.services.config.requeue_delay).await;
        }
    }

    async fn table_has_rows(&self, table: &TableName) -> Result<bool> {
        for meta in self.services.assignment.online_metas() {
            let target = CatalogTarget::Meta(meta.region.name());
            let Some(rows) = self
                .services
                .catalog
                .scan_rows(&target, &catalog::table_scan_start(table))
                .await?
            else {
                return Err(MasterError::ShuttingDown);
            };
            if rows
                .iter()
                .any(|(key, _)| catalog::row_belongs_to_table(table, key))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- run loop ----

    /// Elect, bootstrap or join, spawn chores, and drain operations until
    /// closed. Returns after releasing the leader registration.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let identity = self.services.config.identity.clone();
        loop {
            if self
                .services
                .coordinator
                .try_claim_master(&identity)
                .await?
            {
                break;
            }
            if self.services.coordinator.shutdown_requested().await? {
                tracing::info!("cluster shutdown flagged, candidate exiting");
                return Ok(());
            }
            tracing::info!("another master is active, standing by");
            let watch = self.services.coordinator.watch_master_vacancy().await?;
            watch.fired().await;
        }
        tracing::info!(identity = %identity, "elected master");
        self.services.coordinator.set_cluster_up().await?;

        if !self.services.storage.root_region_exists()? {
            self.bootstrap()?;
        }
        self.failover_join().await?;
        if self.services.assignment.root_location().is_none() {
            self.services
                .assignment
                .set_unassigned(RegionDescriptor::root());
        }

        Self::spawn_session_watch(&self);
        Self::spawn_chores(&self);

        let drain = self.drain_loop().await;
        if let Err(err) = self
            .services
            .coordinator
            .resign_master(&identity)
            .await
        {
            tracing::warn!(error = %err, "failed to release leader registration");
        }
        drain
    }

    /// One-time creation of the first catalog regions: root then meta, with
    /// the meta region's row recorded inside the root before either is ever
    /// served.
    fn bootstrap(&self) -> Result<()> {
        tracing::info!("bootstrapping catalog regions");
        let root = RegionDescriptor::root();
        let meta = RegionDescriptor::first_meta();
        self.services.storage.create_region(&root)?;
        self.services.storage.create_region(&meta)?;
        self.services.storage.seed_region_rows(
            &root,
            &[(meta.name_bytes(), catalog::new_region_cells(&meta))],
        )?;
        Ok(())
    }

    /// Inherit a running cluster: contact every registered server, record it
    /// live, and adopt its reported region set.
    async fn failover_join(&self) -> Result<()> {
        let servers = self.services.coordinator.registered_servers().await?;
        if servers.is_empty() {
            return Ok(());
        }
        tracing::info!(servers = servers.len(), "joining running cluster");
        let mut inventories = FuturesUnordered::new();
        for name in servers {
            let connector = self.services.connector.clone();
            inventories.push(async move {
                let regions = connector.connect(&name.addr)?.served_regions().await?;
                Ok::<_, MasterError>((name, regions))
            });
        }
        while let Some(result) = inventories.next().await {
            let (name, regions) = match result {
                Ok(inventory) => inventory,
                Err(err) => {
                    tracing::warn!(error = %err, "server unreachable during failover join, leaving it to scans");
                    continue;
                }
            };
            tracing::info!(server = %name, regions = regions.len(), "adopted server");
            self.services
                .registry
                .record_live(name.clone(), ServerLoad::new(regions.len() as u32, 0));
            for region in regions {
                if region.is_root() {
                    self.services.assignment.set_root_location(name.clone());
                    let _ = self.services.scan_tx.send(ScanRequest::Root);
                } else if region.is_meta() {
                    self.services.assignment.adopt_open(region.clone(), &name);
                    let meta_ref = CatalogRegionRef {
                        region,
                        server: name.addr.clone(),
                    };
                    self.services.assignment.add_online_meta(meta_ref.clone());
                    let _ = self.services.scan_tx.send(ScanRequest::Meta(meta_ref));
                } else {
                    self.services.assignment.adopt_open(region, &name);
                }
            }
        }
        Ok(())
    }

    /// Watch our own registration; session loss means re-claim or terminate,
    /// never silent continuation as leader.
    fn spawn_session_watch(master: &Arc<Master>) {
        let master = master.clone();
        tokio::spawn(async move {
            let identity = master.services.config.identity.clone();
            loop {
                let watch = match master.services.coordinator.watch_master_vacancy().await {
                    Ok(watch) => watch,
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot watch own registration");
                        return;
                    }
                };
                watch.fired().await;
                if master.is_closed() {
                    return;
                }
                let shutdown = master
                    .services
                    .coordinator
                    .shutdown_requested()
                    .await
                    .unwrap_or(true);
                if shutdown {
                    tracing::info!("session lost during shutdown, terminating");
                    master.services.closed.store(true, Ordering::SeqCst);
                    return;
                }
                match master.services.coordinator.try_claim_master(&identity).await {
                    Ok(true) => {
                        tracing::warn!("leader session lost, re-registered and rejoined");
                    }
                    Ok(false) | Err(_) => {
                        tracing::error!("leader session lost and another master took over, terminating");
                        master.services.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });
    }

    fn spawn_chores(this: &Arc<Master>) {
        // Periodic catalog rescans.
        {
            let master = this.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.services.config.rescan_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if master.is_closed() {
                        return;
                    }
                    if let Err(err) = master.scanner.scan_root().await {
                        tracing::warn!(error = %err, "root scan failed");
                    }
                    for meta in master.services.assignment.online_metas() {
                        if let Err(err) = master.scanner.scan_meta(meta.clone()).await {
                            tracing::warn!(error = %err, meta = %meta.region, "meta scan failed");
                        }
                    }
                }
            });
        }

        // On-demand scans triggered when a catalog region comes online.
        if let Some(mut scan_rx) = this.scan_rx.lock().unwrap().take() {
            let master = this.clone();
            tokio::spawn(async move {
                while let Some(request) = scan_rx.recv().await {
                    if master.is_closed() {
                        return;
                    }
                    let result = match request {
                        ScanRequest::Root => master.scanner.scan_root().await,
                        ScanRequest::Meta(meta) => master.scanner.scan_meta(meta).await,
                    };
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "triggered catalog scan failed");
                    }
                }
            });
        }

        // Filesystem health probe; persistent failure is fatal.
        {
            let master = this.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.services.config.wake_interval * 5);
                loop {
                    ticker.tick().await;
                    if master.is_closed() {
                        return;
                    }
                    if let Err(err) = master.services.storage.probe() {
                        tracing::error!(error = %err, "storage unavailable, closing master");
                        master.services.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            });
        }

        // Retired-log cleaner, bounded per pass.
        {
            let master = this.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.services.config.rescan_interval);
                loop {
                    ticker.tick().await;
                    if master.is_closed() {
                        return;
                    }
                    let logs = match master.services.storage.stale_logs() {
                        Ok(logs) => logs,
                        Err(err) => {
                            tracing::warn!(error = %err, "stale log listing failed");
                            continue;
                        }
                    };
                    for name in logs.iter().take(master.services.config.max_logs_per_cleanup) {
                        if let Err(err) = master.services.storage.delete_log(name) {
                            tracing::warn!(error = %err, log = %name, "stale log delete failed");
                        } else {
                            tracing::debug!(log = %name, "deleted stale log");
                        }
                    }
                }
            });
        }
    }

    async fn drain_loop(&self) -> anyhow::Result<()> {
        let wake = self.services.config.wake_interval;
        let mut waits: u64 = 0;
        loop {
            if self.is_closed() {
                tracing::info!("master closed, drain loop exiting");
                return Ok(());
            }
            if self.services.shutdown_requested.load(Ordering::SeqCst) {
                if self.services.registry.all_quiesced() {
                    tracing::info!("all servers quiesced, closing master");
                    self.services.closed.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                waits += 1;
                if waits % 5 == 0 {
                    tracing::info!(
                        live = self.services.registry.live_count(),
                        open_regions = self.services.assignment.open_region_count(),
                        "waiting for servers to quiesce"
                    );
                }
            }
            let Some(op) = self.services.queue.pop_ready_or_wait(wake).await else {
                continue;
            };
            if !self.services.queue.allow_operation(&op) {
                tracing::debug!(op = %op.describe(), "operation vetoed by listener");
                continue;
            }
            tracing::debug!(op = %op.describe(), "executing operation");
            let done_probe = op.clone();
            match operations::execute(&self.services, op).await {
                Ok(OpOutcome::Done) => self.services.queue.operation_done(&done_probe),
                Ok(OpOutcome::Requeue { op, delay }) => {
                    self.services.queue.submit_delayed(op, delay);
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        op = %done_probe.describe(),
                        "non-retryable operation failure, aborting master"
                    );
                    self.services.closed.store(true, Ordering::SeqCst);
                    return Err(err.into());
                }
            }
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
