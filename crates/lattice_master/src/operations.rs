//! The closed set of coordination operations and their execution.
//!
//! Every region-state transition is driven by exactly one of these variants,
//! dispatched through `execute`. An operation that cannot proceed (unmet
//! precondition, retryable remote failure) is handed back for the delay
//! queue with its progress preserved; structural errors propagate to the
//! caller.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{
    self, decode_row, ColumnFamilyDescriptor, RegionDescriptor, RegionRow, RowContent, TableName,
};
use crate::error::{MasterError, Result};
use crate::master::{MasterServices, ScanRequest};
use crate::registry::ServerName;
use crate::retry::CatalogTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A server reported a region open; record the assignment in the
    /// catalog and transition the region state.
    OpenReport {
        server: ServerName,
        region: RegionDescriptor,
    },
    /// A server reported a region closed.
    CloseReport {
        region: RegionDescriptor,
        offline: bool,
        reassign: bool,
    },
    /// Failure recovery for a dead server.
    ServerShutdown(ShutdownRecovery),
    /// Table-wide DDL.
    Table(TableOperation),
}

impl Operation {
    /// Queue priority: catalog work and failure recovery outrank user-table
    /// work.
    pub fn priority(&self) -> u8 {
        match self {
            Operation::OpenReport { region, .. } | Operation::CloseReport { region, .. } => {
                if region.is_catalog() {
                    0
                } else {
                    1
                }
            }
            Operation::ServerShutdown(_) => 0,
            Operation::Table(_) => 1,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operation::OpenReport { server, region } => {
                format!("open report for {region} from {server}")
            }
            Operation::CloseReport { region, .. } => format!("close report for {region}"),
            Operation::ServerShutdown(rec) => format!("shutdown recovery for {}", rec.server),
            Operation::Table(op) => format!("{} on table {}", op.kind_name(), op.table),
        }
    }
}

/// Resumable shutdown-recovery state. Completed steps are recorded so a
/// requeued operation never repeats destructive work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRecovery {
    pub server: ServerName,
    regions_detached: bool,
    log_split_done: bool,
    root_rescanned: bool,
    metas_rescanned: bool,
}

impl ShutdownRecovery {
    pub fn new(server: ServerName) -> Self {
        ShutdownRecovery {
            server,
            regions_detached: false,
            log_split_done: false,
            root_rescanned: false,
            metas_rescanned: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOperation {
    pub table: TableName,
    pub kind: TableOpKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOpKind {
    Enable,
    Disable,
    Drop,
    AddColumn(ColumnFamilyDescriptor),
    ModifyColumn(ColumnFamilyDescriptor),
    DeleteColumn(String),
}

impl TableOperation {
    fn kind_name(&self) -> &'static str {
        match self.kind {
            TableOpKind::Enable => "enable",
            TableOpKind::Disable => "disable",
            TableOpKind::Drop => "drop",
            TableOpKind::AddColumn(_) => "add-column",
            TableOpKind::ModifyColumn(_) => "modify-column",
            TableOpKind::DeleteColumn(_) => "delete-column",
        }
    }
}

/// Result of executing one operation.
#[derive(Debug)]
pub enum OpOutcome {
    Done,
    /// Put the (possibly updated) operation on the delay queue.
    Requeue { op: Operation, delay: Duration },
}

enum Progress {
    Done,
    /// Precondition unmet; wait and retry.
    Wait,
}

/// Execute one operation. Retryable failures come back as `Requeue` with
/// progress preserved; non-retryable errors propagate.
pub async fn execute(services: &Arc<MasterServices>, op: Operation) -> Result<OpOutcome> {
    let delay = services.config.requeue_delay;
    match op {
        Operation::OpenReport { server, region } => {
            let retry = Operation::OpenReport {
                server: server.clone(),
                region: region.clone(),
            };
            wrap(process_region_open(services, &server, &region).await, retry, delay)
        }
        Operation::CloseReport {
            region,
            offline,
            reassign,
        } => {
            let retry = Operation::CloseReport {
                region: region.clone(),
                offline,
                reassign,
            };
            wrap(
                process_region_close(services, &region, offline, reassign).await,
                retry,
                delay,
            )
        }
        Operation::ServerShutdown(mut rec) => {
            match process_server_shutdown(services, &mut rec).await {
                Ok(Progress::Done) => Ok(OpOutcome::Done),
                Ok(Progress::Wait) => Ok(OpOutcome::Requeue {
                    op: Operation::ServerShutdown(rec),
                    delay,
                }),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(error = %err, server = %rec.server, "shutdown recovery step failed, requeueing");
                    Ok(OpOutcome::Requeue {
                        op: Operation::ServerShutdown(rec),
                        delay,
                    })
                }
                Err(err) => Err(err),
            }
        }
        Operation::Table(table_op) => {
            let retry = Operation::Table(table_op.clone());
            wrap(process_table_operation(services, &table_op).await, retry, delay)
        }
    }
}

/// A catalog call abandoned because the master is shutting down must not
/// read as success to a DDL caller.
fn ensure_done<T>(result: Option<T>) -> Result<T> {
    result.ok_or(MasterError::ShuttingDown)
}

fn wrap(result: Result<Progress>, retry: Operation, delay: Duration) -> Result<OpOutcome> {
    match result {
        Ok(Progress::Done) => Ok(OpOutcome::Done),
        Ok(Progress::Wait) => Ok(OpOutcome::Requeue { op: retry, delay }),
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, op = %retry.describe(), "operation failed, requeueing");
            Ok(OpOutcome::Requeue { op: retry, delay })
        }
        Err(err) => Err(err),
    }
}

/// Catalog region whose row set holds `region`'s row, for targeting and
/// write-lock scoping. Meta regions live in the root; user regions live in
/// their covering meta region.
fn parent_target(
    services: &MasterServices,
    region: &RegionDescriptor,
) -> Option<(CatalogTarget, RegionDescriptor)> {
    if region.is_meta() {
        services
            .assignment
            .root_location()
            .map(|_| (CatalogTarget::Root, RegionDescriptor::root()))
    } else {
        services
            .assignment
            .meta_for_row(&region.name_bytes())
            .map(|m| (CatalogTarget::MetaRowOf(region.name_bytes()), m.region))
    }
}

async fn process_region_open(
    services: &Arc<MasterServices>,
    server: &ServerName,
    region: &RegionDescriptor,
) -> Result<Progress> {
    // The root's location is a single mutable cell, not a catalog row.
    if region.is_root() {
        services.assignment.set_root_location(server.clone());
        tracing::info!(server = %server, "root region online");
        let _ = services.scan_tx.send(ScanRequest::Root);
        return Ok(Progress::Done);
    }

    // Superseded assignments (server died, region reassigned) are dropped.
    match services.assignment.state_of(&region.name()) {
        Some((crate::assignment::RegionStateKind::PendingOpen, Some(owner)))
            if owner == *server => {}
        other => {
            tracing::debug!(region = %region, state = ?other, "open report superseded, ignoring");
            return Ok(Progress::Done);
        }
    }

    let Some((target, parent_region)) = parent_target(services, region) else {
        return Ok(Progress::Wait);
    };

    let _write = services.catalog.write_guard(&parent_region).await;
    let written = services
        .catalog
        .put_cells(
            &target,
            &region.name_bytes(),
            catalog::assignment_cells(&server.addr, server.start_code),
        )
        .await?;
    if written.is_none() {
        return Ok(Progress::Done); // shutting down
    }

    services.assignment.report_open(region, server);
    tracing::info!(region = %region, server = %server, "region open recorded");

    if region.is_meta() {
        let meta_ref = catalog::CatalogRegionRef {
            region: region.clone(),
            server: server.addr.clone(),
        };
        services.assignment.add_online_meta(meta_ref.clone());
        let _ = services.scan_tx.send(ScanRequest::Meta(meta_ref));
    }
    Ok(Progress::Done)
}

async fn process_region_close(
    services: &Arc<MasterServices>,
    region: &RegionDescriptor,
    offline: bool,
    reassign: bool,
) -> Result<Progress> {
    if region.is_root() {
        // Root has no catalog row to update; releasing the location cell is
        // enough to make it reassignable.
        services.assignment.clear_root_location();
        services.assignment.set_unassigned(region.clone());
        return Ok(Progress::Done);
    }

    if offline {
        let Some((target, parent_region)) = parent_target(services, region) else {
            return Ok(Progress::Wait);
        };
        let mut info = region.clone();
        info.offline = true;
        let _write = services.catalog.write_guard(&parent_region).await;
        let written = services
            .catalog
            .put_cells(
                &target,
                &region.name_bytes(),
                vec![(
                    catalog::COL_REGIONINFO.to_string(),
                    catalog::encode_region_info(&info),
                )],
            )
            .await?;
        if written.is_none() {
            return Ok(Progress::Done);
        }
        services
            .catalog
            .delete_cells(
                &target,
                &region.name_bytes(),
                vec![
                    catalog::COL_SERVER.to_string(),
                    catalog::COL_STARTCODE.to_string(),
                ],
            )
            .await?;
        // Offlined regions bypass UNASSIGNED and leave the state table.
        services.assignment.remove_region(region);
        tracing::info!(region = %region, "region taken offline");
    } else if reassign {
        services.assignment.set_unassigned(region.clone());
        tracing::info!(region = %region, "region released for reassignment");
    }
    Ok(Progress::Done)
}

/// Failure recovery: detach, split logs, rescan root then meta, release
/// in-transition regions, clear the dead-set entry.
async fn process_server_shutdown(
    services: &Arc<MasterServices>,
    rec: &mut ShutdownRecovery,
) -> Result<Progress> {
    let server = rec.server.clone();

    if !rec.regions_detached {
        let released = services.assignment.release_server_regions(&server.addr);
        tracing::info!(server = %server, released, "detached regions from dead server");
        rec.regions_detached = true;
    }

    if !rec.log_split_done {
        // One shutdown operation splits logs at a time.
        let _split = services.log_split_lock.lock().await;
        services.storage.split_server_log(&server)?;
        rec.log_split_done = true;
        tracing::info!(server = %server, "write-ahead log split complete");
    }

    if !services.assignment.root_is_online() {
        return Ok(Progress::Wait);
    }

    if !rec.root_rescanned {
        rescan_catalog_region(services, &CatalogTarget::Root, &server).await?;
        rec.root_rescanned = true;
    }

    if services.assignment.online_metas().len() < services.assignment.meta_region_total() {
        return Ok(Progress::Wait);
    }

    if !rec.metas_rescanned {
        for meta in services.assignment.online_metas() {
            rescan_catalog_region(services, &CatalogTarget::Meta(meta.region.name()), &server)
                .await?;
        }
        rec.metas_rescanned = true;
    }

    // Anything that transitioned onto the dead server since detach.
    services.assignment.release_server_regions(&server.addr);
    services.registry.clear_dead(&server);
    tracing::info!(server = %server, "shutdown recovery complete");
    Ok(Progress::Done)
}

/// Re-scan one catalog region, releasing every row still recorded against
/// the dead server and clearing undecodable rows.
async fn rescan_catalog_region(
    services: &Arc<MasterServices>,
    target: &CatalogTarget,
    dead: &ServerName,
) -> Result<()> {
    let Some(rows) = services.catalog.scan_rows(target, b"").await? else {
        return Ok(());
    };
    let mut empty_rows = Vec::new();
    for (key, cells) in rows {
        match decode_row(&cells) {
            RowContent::Empty => empty_rows.push(key),
            RowContent::Region(row) => {
                let matches_dead = row.server.as_deref() == Some(dead.addr.as_str())
                    && row.start_code == Some(dead.start_code);
                if matches_dead && !row.info.split {
                    tracing::info!(region = %row.info, server = %dead, "region of dead server queued for reassignment");
                    services.assignment.set_unassigned(row.info);
                }
            }
        }
    }
    for key in empty_rows {
        tracing::warn!(row = %catalog::key_display(&key), "removing undecodable catalog row");
        services.catalog.delete_row(target, &key).await?;
    }
    Ok(())
}

/// Common DDL template: collect every row of the table (per-row
/// precondition applied), then mutate table-wide. Runs under the
/// scanner-exclusion lock.
async fn process_table_operation(
    services: &Arc<MasterServices>,
    op: &TableOperation,
) -> Result<Progress> {
    if op.table.is_catalog() {
        return Err(MasterError::InvalidTable(op.table.0.clone()));
    }
    if !services.assignment.all_metas_scanned()
        || services.registry.live_count() < services.config.min_live_servers
    {
        return Ok(Progress::Wait);
    }

    let _ddl = services.scan_lock.lock().await;

    let mut matches: Vec<(String, Vec<u8>, RegionRow)> = Vec::new();
    for meta in services.assignment.online_metas() {
        let target = CatalogTarget::Meta(meta.region.name());
        let Some(rows) = services
            .catalog
            .scan_rows(&target, &catalog::table_scan_start(&op.table))
            .await?
        else {
            return Err(MasterError::ShuttingDown);
        };
        for (key, cells) in rows {
            if !catalog::row_belongs_to_table(&op.table, &key) {
                break;
            }
            if let RowContent::Region(row) = decode_row(&cells) {
                matches.push((meta.region.name(), key, *row));
            }
        }
    }

    if matches.is_empty() {
        return Err(MasterError::TableNotFound(op.table.0.clone()));
    }

    // Structure-changing operations require every region disabled first.
    let needs_disabled = matches!(
        op.kind,
        TableOpKind::Drop
            | TableOpKind::AddColumn(_)
            | TableOpKind::ModifyColumn(_)
            | TableOpKind::DeleteColumn(_)
    );
    if needs_disabled && matches.iter().any(|(_, _, row)| !row.info.offline) {
        return Err(MasterError::TableNotDisabled(op.table.0.clone()));
    }
    if let TableOpKind::AddColumn(cf) | TableOpKind::ModifyColumn(cf) = &op.kind {
        ColumnFamilyDescriptor::validate_name(&cf.name)?;
    }

    for (meta_name, key, row) in matches {
        let target = CatalogTarget::Meta(meta_name.clone());
        let meta_region = services
            .assignment
            .online_metas()
            .into_iter()
            .find(|m| m.region.name() == meta_name)
            .map(|m| m.region)
            .ok_or(MasterError::CatalogOffline)?;
        let _write = services.catalog.write_guard(&meta_region).await;
        apply_table_mutation(services, op, &target, &key, row).await?;
    }
    tracing::info!(table = %op.table, op = op.kind_name(), "table operation complete");
    Ok(Progress::Done)
}

async fn apply_table_mutation(
    services: &Arc<MasterServices>,
    op: &TableOperation,
    target: &CatalogTarget,
    key: &[u8],
    row: RegionRow,
) -> Result<()> {
    match &op.kind {
        TableOpKind::Enable => {
            if services.assignment.in_transition(&row.info.name()) {
                tracing::debug!(region = %row.info, "already mid-open, skipping enable");
                return Ok(());
            }
            let mut info = row.info.clone();
            info.offline = false;
            ensure_done(
                services
                    .catalog
                    .put_cells(
                        target,
                        key,
                        vec![(
                            catalog::COL_REGIONINFO.to_string(),
                            catalog::encode_region_info(&info),
                        )],
                    )
                    .await?,
            )?;
            services.assignment.set_unassigned(info);
        }
        TableOpKind::Disable => {
            let mut info = row.info.clone();
            info.offline = true;
            ensure_done(
                services
                    .catalog
                    .put_cells(
                        target,
                        key,
                        vec![(
                            catalog::COL_REGIONINFO.to_string(),
                            catalog::encode_region_info(&info),
                        )],
                    )
                    .await?,
            )?;
            match services.assignment.state_of(&row.info.name()) {
                Some((crate::assignment::RegionStateKind::Open, Some(server))) => {
                    services
                        .assignment
                        .mark_close(&server, &row.info, true, false);
                }
                _ => {
                    // Not currently served; drop it from the state table so
                    // it cannot be assigned while disabled.
                    services.assignment.remove_region(&row.info);
                }
            }
        }
        TableOpKind::Drop => {
            ensure_done(services.catalog.delete_row(target, key).await?)?;
            services.storage.delete_region(&row.info)?;
            services.assignment.remove_region(&row.info);
        }
        TableOpKind::AddColumn(cf) => {
            if row.info.families.iter().any(|f| f.name == cf.name) {
                return Err(MasterError::InvalidColumn(format!(
                    "column family {} already exists",
                    cf.name
                )));
            }
            let mut info = row.info.clone();
            info.families.push(cf.clone());
            services.storage.create_region(&info)?;
            ensure_done(
                services
                    .catalog
                    .put_cells(
                        target,
                        key,
                        vec![(
                            catalog::COL_REGIONINFO.to_string(),
                            catalog::encode_region_info(&info),
                        )],
                    )
                    .await?,
            )?;
        }
        TableOpKind::ModifyColumn(cf) => {
            let mut info = row.info.clone();
            let slot = info
                .families
                .iter_mut()
                .find(|f| f.name == cf.name)
                .ok_or_else(|| MasterError::InvalidColumn(cf.name.clone()))?;
            *slot = cf.clone();
            ensure_done(
                services
                    .catalog
                    .put_cells(
                        target,
                        key,
                        vec![(
                            catalog::COL_REGIONINFO.to_string(),
                            catalog::encode_region_info(&info),
                        )],
                    )
                    .await?,
            )?;
        }
        TableOpKind::DeleteColumn(name) => {
            let mut info = row.info.clone();
            let before = info.families.len();
            info.families.retain(|f| f.name != *name);
            if info.families.len() == before {
                return Err(MasterError::InvalidColumn(name.clone()));
            }
            ensure_done(
                services
                    .catalog
                    .put_cells(
                        target,
                        key,
                        vec![(
                            catalog::COL_REGIONINFO.to_string(),
                            catalog::encode_region_info(&info),
                        )],
                    )
                    .await?,
            )?;
            services.storage.delete_column_family(&row.info, name)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::catalog::CatalogRegionRef;
    use crate::connection::{MemoryCluster, MemoryRegionServer};
    use crate::coordination::{Coordinator, MemoryCoordinator};
    use crate::load::ServerLoad;
    use crate::master::{MasterConfig, MasterServices, ScanRequest};
    use crate::registry::RegistryConfig;
    use crate::storage::{LocalFsStorage, TableStorage};

    struct Fixture {
        services: Arc<MasterServices>,
        coordinator: Arc<MemoryCoordinator>,
        cluster: Arc<MemoryCluster>,
        storage: Arc<LocalFsStorage>,
        _scan_rx: mpsc::UnboundedReceiver<ScanRequest>,
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "lattice-operations-{tag}-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&dir);
            let storage = Arc::new(LocalFsStorage::new(dir).unwrap());
            let coordinator = Arc::new(MemoryCoordinator::new());
            let cluster = MemoryCluster::new();
            let config = MasterConfig {
                retry_count: 1,
                retry_sleep: Duration::from_millis(5),
                requeue_delay: Duration::from_millis(20),
                min_live_servers: 1,
                registry: RegistryConfig {
                    report_interval: Duration::from_millis(20),
                    ..RegistryConfig::default()
                },
                ..MasterConfig::default()
            };
            let (services, scan_rx) = MasterServices::build(
                config,
                coordinator.clone(),
                cluster.clone(),
                storage.clone(),
            );
            Fixture {
                services,
                coordinator,
                cluster,
                storage,
                _scan_rx: scan_rx,
            }
        }

        async fn live_server(&self, addr: &str, code: u64) -> (ServerName, Arc<MemoryRegionServer>) {
            let name = ServerName::new(addr, code);
            self.coordinator.register_server(&name).await.unwrap();
            let rs = MemoryRegionServer::new(addr);
            rs.attach_storage(self.storage.clone());
            self.cluster.add_server(rs.clone());
            self.services
                .registry
                .record_live(name.clone(), ServerLoad::default());
            (name, rs)
        }

        /// Host a meta region on the server and record it online/scanned so
        /// user-table operations may proceed.
        fn meta_online(
            &self,
            name: &ServerName,
            rs: &Arc<MemoryRegionServer>,
            rows: Vec<(Vec<u8>, catalog::RowCells)>,
        ) -> RegionDescriptor {
            let meta = RegionDescriptor::first_meta();
            rs.host_catalog_region(meta.clone(), rows);
            self.services.assignment.add_online_meta(CatalogRegionRef {
                region: meta.clone(),
                server: name.addr.clone(),
            });
            self.services.assignment.mark_root_scanned();
            self.services.assignment.mark_meta_scanned(&meta.name());
            meta
        }
    }

    fn user_region(start: &[u8], end: &[u8], id: u64) -> RegionDescriptor {
        RegionDescriptor::new(TableName("orders".into()), start.to_vec(), end.to_vec(), id)
    }

    fn assigned_cells(info: &RegionDescriptor, name: &ServerName) -> catalog::RowCells {
        let mut cells = catalog::new_region_cells(info);
        for (col, val) in catalog::assignment_cells(&name.addr, name.start_code) {
            cells.insert(col, val);
        }
        cells
    }

    #[tokio::test]
    async fn open_report_records_assignment_in_catalog() {
        let f = Fixture::new("open");
        let (name, rs) = f.live_server("10.0.0.1:7200", 100).await;
        let meta = f.meta_online(&name, &rs, vec![]);

        let region = user_region(b"", b"", 9);
        f.services.assignment.set_unassigned(region.clone());
        let batch = f.services.assignment.assign_batch(&name, 8);
        assert_eq!(batch, vec![region.clone()]);

        let outcome = execute(
            &f.services,
            Operation::OpenReport {
                server: name.clone(),
                region: region.clone(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(outcome, OpOutcome::Done));

        let cells = rs.row(&meta.encoded_name(), &region.name_bytes()).unwrap();
        assert_eq!(
            cells.get(catalog::COL_SERVER).map(|v| v.as_ref()),
            Some(name.addr.as_bytes())
        );
        assert_eq!(
            f.services.assignment.state_of(&region.name()).unwrap().0,
            crate::assignment::RegionStateKind::Open
        );
    }

    #[tokio::test]
    async fn open_report_waits_for_owning_meta() {
        let f = Fixture::new("open-wait");
        let (name, _rs) = f.live_server("10.0.0.1:7200", 100).await;

        let region = user_region(b"", b"", 9);
        f.services.assignment.set_unassigned(region.clone());
        let _ = f.services.assignment.assign_batch(&name, 8);

        let outcome = execute(
            &f.services,
            Operation::OpenReport {
                server: name,
                region,
            },
        )
        .await
        .unwrap();
        assert!(matches!(outcome, OpOutcome::Requeue { .. }));
    }

    #[tokio::test]
    async fn superseded_open_report_is_dropped() {
        let f = Fixture::new("open-superseded");
        let (name, rs) = f.live_server("10.0.0.1:7200", 100).await;
        let meta = f.meta_online(&name, &rs, vec![]);

        // Region is not pending on anyone: the report is stale.
        let region = user_region(b"", b"", 9);
        let outcome = execute(
            &f.services,
            Operation::OpenReport {
                server: name,
                region: region.clone(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(outcome, OpOutcome::Done));
        assert!(rs.row(&meta.encoded_name(), &region.name_bytes()).is_none());
    }

    #[tokio::test]
    async fn offline_close_updates_row_and_drops_state() {
        let f = Fixture::new("close-offline");
        let (name, rs) = f.live_server("10.0.0.1:7200", 100).await;
        let region = user_region(b"", b"", 9);
        let meta = f.meta_online(
            &name,
            &rs,
            vec![(region.name_bytes(), assigned_cells(&region, &name))],
        );
        f.services.assignment.report_open(&region, &name);

        let outcome = execute(
            &f.services,
            Operation::CloseReport {
                region: region.clone(),
                offline: true,
                reassign: false,
            },
        )
        .await
        .unwrap();
        assert!(matches!(outcome, OpOutcome::Done));

        let cells = rs.row(&meta.encoded_name(), &region.name_bytes()).unwrap();
        assert!(!cells.contains_key(catalog::COL_SERVER));
        match decode_row(&cells) {
            RowContent::Region(row) => assert!(row.info.offline),
            RowContent::Empty => panic!("row should decode"),
        }
        assert!(f.services.assignment.state_of(&region.name()).is_none());
    }

    #[tokio::test]
    async fn shutdown_recovery_reassigns_and_clears_dead_set() {
        let f = Fixture::new("shutdown");
        let dead = ServerName::new("10.0.0.9:7200", 42);
        let (survivor, rs) = f.live_server("10.0.0.1:7200", 100).await;

        // Catalog state: the meta region lives on the survivor; one user
        // region row still points at the dead server.
        let region = user_region(b"", b"", 9);
        f.meta_online(
            &survivor,
            &rs,
            vec![(region.name_bytes(), assigned_cells(&region, &dead))],
        );
        // Root also lives on the survivor.
        rs.host_catalog_region(RegionDescriptor::root(), vec![]);
        f.services.assignment.set_root_location(survivor.clone());

        // The dead server left a write-ahead log behind.
        f.storage.ensure_server_log(&dead).unwrap();

        // Simulate the death-watch path so the dead set is populated.
        f.services
            .registry
            .record_live(dead.clone(), ServerLoad::default());
        f.services.registry.server_expired(dead.clone());
        assert!(f.services.registry.is_dead(&dead));

        let outcome = execute(
            &f.services,
            Operation::ServerShutdown(ShutdownRecovery::new(dead.clone())),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, OpOutcome::Done));

        assert!(!f.storage.server_log_exists(&dead));
        assert_eq!(
            f.services.assignment.state_of(&region.name()).unwrap().0,
            crate::assignment::RegionStateKind::Unassigned
        );
        assert!(!f.services.registry.is_dead(&dead));
    }

    #[tokio::test]
    async fn shutdown_recovery_waits_for_root() {
        let f = Fixture::new("shutdown-wait");
        let dead = ServerName::new("10.0.0.9:7200", 42);
        let outcome = execute(
            &f.services,
            Operation::ServerShutdown(ShutdownRecovery::new(dead)),
        )
        .await
        .unwrap();
        // Log split ran, then the operation parked awaiting the root.
        match outcome {
            OpOutcome::Requeue { op, .. } => match op {
                Operation::ServerShutdown(rec) => {
                    assert!(rec.log_split_done);
                    assert!(!rec.root_rescanned);
                }
                other => panic!("unexpected op: {other:?}"),
            },
            OpOutcome::Done => panic!("expected requeue"),
        }
    }

    #[tokio::test]
    async fn table_operation_on_missing_table_fails_fast() {
        let f = Fixture::new("table-missing");
        let (name, rs) = f.live_server("10.0.0.1:7200", 100).await;
        f.meta_online(&name, &rs, vec![]);

        let err = execute(
            &f.services,
            Operation::Table(TableOperation {
                table: TableName("nosuch".into()),
                kind: TableOpKind::Drop,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MasterError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn delete_column_requires_disabled_table() {
        let f = Fixture::new("table-column");
        let (name, rs) = f.live_server("10.0.0.1:7200", 100).await;

        let mut region = user_region(b"", b"", 9);
        region.families = vec![
            ColumnFamilyDescriptor::new("d"),
            ColumnFamilyDescriptor::new("idx"),
        ];
        f.storage.create_region(&region).unwrap();
        let meta = f.meta_online(
            &name,
            &rs,
            vec![(region.name_bytes(), catalog::new_region_cells(&region))],
        );

        let op = Operation::Table(TableOperation {
            table: region.table.clone(),
            kind: TableOpKind::DeleteColumn("idx".into()),
        });
        let err = execute(&f.services, op.clone()).await.unwrap_err();
        assert!(matches!(err, MasterError::TableNotDisabled(_)));

        // Disable, then the same call succeeds.
        let disable = Operation::Table(TableOperation {
            table: region.table.clone(),
            kind: TableOpKind::Disable,
        });
        assert!(matches!(
            execute(&f.services, disable).await.unwrap(),
            OpOutcome::Done
        ));
        assert!(matches!(
            execute(&f.services, op).await.unwrap(),
            OpOutcome::Done
        ));

        let cells = rs.row(&meta.encoded_name(), &region.name_bytes()).unwrap();
        match decode_row(&cells) {
            RowContent::Region(row) => {
                assert!(row.info.families.iter().all(|cf| cf.name != "idx"));
            }
            RowContent::Empty => panic!("row should decode"),
        }
        // The column family's storage directory is gone too.
        assert!(!f.storage.column_family_exists(&region, "idx"));
        assert!(f.storage.column_family_exists(&region, "d"));
    }
}
