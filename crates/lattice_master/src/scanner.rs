//! Periodic and on-demand catalog scans.
//!
//! A scan reconciles recorded assignment against the live registry, cleans
//! undecodable rows, and garbage-collects split parents whose daughters no
//! longer reference parent data. Scans never transition region state
//! themselves beyond queueing a region for assignment; corrective work flows
//! through the normal operation path.

use std::sync::Arc;

use crate::catalog::{
    self, decode_row, CatalogRegionRef, RegionDescriptor, RegionRow, RowContent,
};
use crate::error::Result;
use crate::master::MasterServices;
use crate::retry::CatalogTarget;

pub struct CatalogScanner {
    services: Arc<MasterServices>,
}

impl CatalogScanner {
    pub fn new(services: Arc<MasterServices>) -> Arc<Self> {
        Arc::new(CatalogScanner { services })
    }

    /// Scan the root region: reconcile meta-region assignment and refresh
    /// the known-meta-region count that gates user-table operations.
    pub async fn scan_root(&self) -> Result<()> {
        if !self.services.assignment.root_is_online() {
            return Ok(());
        }
        let _scan = self.services.scan_lock.lock().await;
        let target = CatalogTarget::Root;
        let Some(rows) = self.services.catalog.scan_rows(&target, b"").await? else {
            return Ok(());
        };
        tracing::debug!(rows = rows.len(), "root scan");
        let meta_rows = self.process_rows(&target, rows).await?;
        self.services.assignment.set_meta_region_total(meta_rows);
        self.services.assignment.mark_root_scanned();
        Ok(())
    }

    /// Scan one meta region.
    pub async fn scan_meta(&self, meta: CatalogRegionRef) -> Result<()> {
        let name = meta.region.name();
        let online = self
            .services
            .assignment
            .online_metas()
            .iter()
            .any(|m| m.region.name() == name);
        if !online {
            return Ok(());
        }
        let _scan = self.services.scan_lock.lock().await;
        let target = CatalogTarget::Meta(name.clone());
        let Some(rows) = self.services.catalog.scan_rows(&target, b"").await? else {
            return Ok(());
        };
        tracing::debug!(meta = %meta.region, rows = rows.len(), "meta scan");
        self.process_rows(&target, rows).await?;
        self.services.assignment.mark_meta_scanned(&name);
        Ok(())
    }

    /// First pass over the scanned rows; returns the number of live meta
    /// regions seen (meaningful for root scans only). Split parents are
    /// deferred to the GC pass.
    async fn process_rows(
        &self,
        target: &CatalogTarget,
        rows: Vec<(Vec<u8>, catalog::RowCells)>,
    ) -> Result<usize> {
        let mut empty_rows = Vec::new();
        let mut split_parents = Vec::new();
        let mut meta_rows = 0usize;
        for (key, cells) in rows {
            match decode_row(&cells) {
                RowContent::Empty => empty_rows.push(key),
                RowContent::Region(row) => {
                    if row.info.split {
                        split_parents.push((key, *row));
                        continue;
                    }
                    if row.info.is_meta() && !row.info.offline {
                        meta_rows += 1;
                    }
                    self.check_assigned(target, &key, &row).await?;
                }
            }
        }
        for key in empty_rows {
            tracing::warn!(row = %catalog::key_display(&key), "removing undecodable catalog row");
            self.services.catalog.delete_row(target, &key).await?;
        }
        for (key, row) in split_parents {
            self.cleanup_split_parent(target, &key, &row).await?;
        }
        Ok(meta_rows)
    }

    /// Verify a row's recorded assignment against the live registry and
    /// queue the region for assignment when its server is gone. Rows whose
    /// recorded server looks unknown are re-read directly once to defeat
    /// scan staleness before any conclusion is drawn.
    async fn check_assigned(
        &self,
        target: &CatalogTarget,
        key: &[u8],
        row: &RegionRow,
    ) -> Result<()> {
        let info = &row.info;
        if info.offline || self.services.assignment.in_transition(&info.name()) {
            return Ok(());
        }
        let Some(addr) = &row.server else {
            tracing::info!(region = %info, "catalog row has no assignment, queueing");
            self.services.assignment.set_unassigned(info.clone());
            return Ok(());
        };
        if self.services.registry.is_live(addr, row.start_code) {
            return Ok(());
        }

        let Some(fresh) = self.services.catalog.get_row(target, key).await? else {
            return Ok(());
        };
        let fresh_row = fresh.and_then(|cells| match decode_row(&cells) {
            RowContent::Region(row) => Some(*row),
            RowContent::Empty => None,
        });
        match fresh_row {
            Some(fresh) => {
                let still_live = fresh
                    .server
                    .as_deref()
                    .map(|addr| self.services.registry.is_live(addr, fresh.start_code))
                    .unwrap_or(false);
                if still_live || self.services.assignment.in_transition(&fresh.info.name()) {
                    return Ok(());
                }
                tracing::info!(
                    region = %fresh.info,
                    server = fresh.server.as_deref().unwrap_or("-"),
                    "recorded server not live, queueing region for assignment"
                );
                self.services.assignment.set_unassigned(fresh.info);
            }
            None => {
                // Row vanished or went undecodable between scan and re-read;
                // the next scan deals with it.
            }
        }
        Ok(())
    }

    /// Second pass: a split parent is removed only after both daughters hold
    /// no reference files and have their own catalog rows present.
    async fn cleanup_split_parent(
        &self,
        target: &CatalogTarget,
        key: &[u8],
        row: &RegionRow,
    ) -> Result<()> {
        let parent = &row.info;
        let still_a = self
            .check_daughter(
                target,
                key,
                parent,
                row.split_a.as_ref(),
                row.split_a_checked,
                catalog::COL_SPLIT_A,
                catalog::COL_SPLIT_A_CHECKED,
            )
            .await?;
        let still_b = self
            .check_daughter(
                target,
                key,
                parent,
                row.split_b.as_ref(),
                row.split_b_checked,
                catalog::COL_SPLIT_B,
                catalog::COL_SPLIT_B_CHECKED,
            )
            .await?;
        if still_a || still_b {
            tracing::debug!(parent = %parent, "split parent retained, daughters still referencing");
            return Ok(());
        }
        tracing::info!(parent = %parent, "split parent fully dereferenced, removing");
        self.services.catalog.delete_row(target, key).await?;
        self.services.storage.delete_region(parent)?;
        Ok(())
    }

    /// Returns true while the daughter still pins the parent. A daughter
    /// with no remaining references has its catalog reference removed,
    /// preceded by a one-shot checked marker so repeat scans skip the
    /// filesystem check.
    async fn check_daughter(
        &self,
        target: &CatalogTarget,
        parent_key: &[u8],
        parent: &RegionDescriptor,
        daughter: Option<&RegionDescriptor>,
        checked: bool,
        split_col: &str,
        checked_col: &str,
    ) -> Result<bool> {
        let Some(daughter) = daughter else {
            return Ok(false); // reference already removed by an earlier scan
        };

        // Self-healing: the daughter's own row must exist before the parent
        // may ever be let go.
        self.ensure_daughter_row(daughter).await?;

        if !checked
            && self
                .services
                .storage
                .daughter_has_references(parent, daughter)?
        {
            return Ok(true);
        }

        self.services
            .catalog
            .put_cells(
                target,
                parent_key,
                vec![(
                    checked_col.to_string(),
                    bytes::Bytes::from_static(b"true"),
                )],
            )
            .await?;
        self.services
            .catalog
            .delete_cells(target, parent_key, vec![split_col.to_string()])
            .await?;
        tracing::info!(parent = %parent, daughter = %daughter, "daughter dereferenced, catalog reference dropped");
        Ok(false)
    }

    /// Re-insert a daughter row that a crash left missing.
    async fn ensure_daughter_row(&self, daughter: &RegionDescriptor) -> Result<()> {
        let target = if daughter.is_meta() {
            CatalogTarget::Root
        } else {
            CatalogTarget::MetaRowOf(daughter.name_bytes())
        };
        let Some(existing) = self
            .services
            .catalog
            .get_row(&target, &daughter.name_bytes())
            .await?
        else {
            return Ok(());
        };
        let present = existing
            .map(|cells| matches!(decode_row(&cells), RowContent::Region(_)))
            .unwrap_or(false);
        if present {
            return Ok(());
        }
        tracing::warn!(region = %daughter, "daughter catalog row missing, re-inserting");
        self.services
            .catalog
            .put_cells(
                &target,
                &daughter.name_bytes(),
                catalog::new_region_cells(daughter).into_iter().collect(),
            )
            .await?;
        Ok(())
    }
}
