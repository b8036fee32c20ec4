//! In-memory region assignment state: the per-region state machine, the
//! root-location cell, and the online-meta cache.
//!
//! All mutation happens under one coarse lock with the full
//! read-decide-mutate sequence inside the critical section; duplicate-open
//! detection depends on that scope. Every transition is driven by exactly
//! one operation — scans only detect inconsistency and enqueue corrective
//! work.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::catalog::{CatalogRegionRef, RegionDescriptor};
use crate::registry::ServerName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionStateKind {
    Unassigned,
    PendingOpen,
    Open,
    PendingClose,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RegionState {
    pub region: RegionDescriptor,
    pub kind: RegionStateKind,
    pub server: Option<ServerName>,
    assigned_at: Option<Instant>,
    close_offline: bool,
    close_reassign: bool,
}

impl RegionState {
    fn new(region: RegionDescriptor) -> Self {
        RegionState {
            region,
            kind: RegionStateKind::Unassigned,
            server: None,
            assigned_at: None,
            close_offline: false,
            close_reassign: true,
        }
    }
}

/// Disposition of an incoming open report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDisposition {
    /// The reporting server was assigned this region; proceed.
    Expected,
    /// Someone else owns the assignment (or nobody does). The reporting
    /// server is told to close without generating a close report.
    Duplicate,
}

#[derive(Default)]
struct AssignInner {
    regions: BTreeMap<String, RegionState>,
    root_location: Option<ServerName>,
    online_metas: BTreeMap<String, CatalogRegionRef>,
    meta_region_total: usize,
    root_scanned: bool,
    metas_scanned: BTreeSet<String>,
    marked_to_close: HashMap<String, BTreeMap<String, RegionDescriptor>>,
}

pub struct AssignmentState {
    inner: Mutex<AssignInner>,
    assignment_timeout: Duration,
}

impl AssignmentState {
    pub fn new(assignment_timeout: Duration) -> Self {
        AssignmentState {
            inner: Mutex::new(AssignInner::default()),
            assignment_timeout,
        }
    }

    /// Make a region eligible for assignment. Idempotent; regions already
    /// assigned or mid-transition are left alone, offline regions are never
    /// made assignable.
    pub fn set_unassigned(&self, region: RegionDescriptor) {
        if region.offline || region.split {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let name = region.name();
        if let Some(state) = inner.regions.get_mut(&name) {
            if state.kind == RegionStateKind::Closed {
                state.kind = RegionStateKind::Unassigned;
                state.server = None;
                state.assigned_at = None;
                state.close_offline = false;
                state.close_reassign = true;
            }
            return;
        }
        inner.regions.insert(name, RegionState::new(region));
    }

    /// Pick assignment candidates for a heartbeating server and transition
    /// them to `PendingOpen` in the same critical section. Catalog regions
    /// always go first and are not counted against `max_user`. A
    /// `PendingOpen` assignment that has sat unacknowledged past the
    /// assignment timeout is reclaimed here.
    pub fn assign_batch(&self, server: &ServerName, max_user: usize) -> Vec<RegionDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let timeout = self.assignment_timeout;
        let mut picked = Vec::new();
        let mut user_picked = 0usize;
        for state in inner.regions.values_mut() {
            let eligible = match state.kind {
                RegionStateKind::Unassigned => true,
                RegionStateKind::PendingOpen => state
                    .assigned_at
                    .map(|t| now.duration_since(t) >= timeout)
                    .unwrap_or(true),
                _ => false,
            };
            if !eligible {
                continue;
            }
            if !state.region.is_catalog() {
                if user_picked >= max_user {
                    continue;
                }
                user_picked += 1;
            }
            state.kind = RegionStateKind::PendingOpen;
            state.server = Some(server.clone());
            state.assigned_at = Some(now);
            picked.push(state.region.clone());
        }
        // Catalog regions first in the delivered instruction order.
        picked.sort_by_key(|r| (!r.is_root(), !r.is_meta(), r.name()));
        picked
    }

    pub fn open_disposition(&self, region: &RegionDescriptor, server: &ServerName) -> OpenDisposition {
        let inner = self.inner.lock().unwrap();
        match inner.regions.get(&region.name()) {
            Some(state)
                if state.kind == RegionStateKind::PendingOpen
                    && state.server.as_ref() == Some(server) =>
            {
                OpenDisposition::Expected
            }
            _ => OpenDisposition::Duplicate,
        }
    }

    /// Confirm an open after the catalog row has been written.
    pub fn report_open(&self, region: &RegionDescriptor, server: &ServerName) {
        let mut inner = self.inner.lock().unwrap();
        if region.is_root() {
            inner.root_location = Some(server.clone());
        }
        let state = inner
            .regions
            .entry(region.name())
            .or_insert_with(|| RegionState::new(region.clone()));
        state.kind = RegionStateKind::Open;
        state.server = Some(server.clone());
        state.assigned_at = None;
    }

    /// Record a region as open without a transition; used by the failover
    /// join when adopting a running cluster.
    pub fn adopt_open(&self, region: RegionDescriptor, server: &ServerName) {
        self.report_open(&region, server);
    }

    /// Administratively close a region currently served by `server`.
    pub fn mark_close(
        &self,
        server: &ServerName,
        region: &RegionDescriptor,
        offline: bool,
        reassign: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let name = region.name();
        let state = inner
            .regions
            .entry(name.clone())
            .or_insert_with(|| RegionState::new(region.clone()));
        state.kind = RegionStateKind::PendingClose;
        state.server = Some(server.clone());
        state.close_offline = offline;
        state.close_reassign = reassign;
        inner
            .marked_to_close
            .entry(server.addr.clone())
            .or_default()
            .insert(name, region.clone());
    }

    /// Drain the marked-to-close set for a server, transitioning each region
    /// to `Closing` as the instruction is handed out.
    pub fn take_marked_to_close(&self, addr: &str) -> Vec<RegionDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        let Some(marked) = inner.marked_to_close.remove(addr) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (name, region) in marked {
            if let Some(state) = inner.regions.get_mut(&name) {
                state.kind = RegionStateKind::Closing;
            }
            out.push(region);
        }
        out
    }

    /// Intent recorded when the close was requested: (offline, reassign).
    /// Unsolicited closes (server-side error) default to reassignment.
    pub fn close_intent(&self, region: &RegionDescriptor) -> (bool, bool) {
        let inner = self.inner.lock().unwrap();
        inner
            .regions
            .get(&region.name())
            .map(|s| (s.close_offline, s.close_reassign))
            .unwrap_or((false, true))
    }

    pub fn report_closed(&self, region: &RegionDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.regions.get_mut(&region.name()) {
            state.kind = RegionStateKind::Closed;
            state.server = None;
        }
    }

    /// Remove a region from the state table entirely (deleted, or taken
    /// offline once its catalog row says so).
    pub fn remove_region(&self, region: &RegionDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        let name = region.name();
        inner.regions.remove(&name);
        inner.online_metas.remove(&name);
        if region.is_root() && inner.root_location.is_some() {
            inner.root_location = None;
        }
    }

    pub fn root_location(&self) -> Option<ServerName> {
        self.inner.lock().unwrap().root_location.clone()
    }

    pub fn clear_root_location(&self) {
        self.inner.lock().unwrap().root_location = None;
    }

    pub fn set_root_location(&self, server: ServerName) {
        let mut inner = self.inner.lock().unwrap();
        inner.root_location = Some(server.clone());
        let root = RegionDescriptor::root();
        let state = inner
            .regions
            .entry(root.name())
            .or_insert_with(|| RegionState::new(root));
        state.kind = RegionStateKind::Open;
        state.server = Some(server);
    }

    pub fn root_is_online(&self) -> bool {
        self.inner.lock().unwrap().root_location.is_some()
    }

    pub fn add_online_meta(&self, meta: CatalogRegionRef) {
        let mut inner = self.inner.lock().unwrap();
        inner.online_metas.insert(meta.region.name(), meta);
        if inner.meta_region_total < inner.online_metas.len() {
            inner.meta_region_total = inner.online_metas.len();
        }
    }

    pub fn online_metas(&self) -> Vec<CatalogRegionRef> {
        self.inner.lock().unwrap().online_metas.values().cloned().collect()
    }

    /// Meta region whose key range covers a catalog row key.
    pub fn meta_for_row(&self, row: &[u8]) -> Option<CatalogRegionRef> {
        let inner = self.inner.lock().unwrap();
        inner
            .online_metas
            .values()
            .find(|m| m.region.contains_row(row))
            .cloned()
    }

    pub fn set_meta_region_total(&self, total: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta_region_total = total.max(1);
    }

    /// A meta region split into two; the expected population grows by one.
    pub fn note_meta_split(&self) {
        self.inner.lock().unwrap().meta_region_total += 1;
    }

    pub fn meta_region_total(&self) -> usize {
        self.inner.lock().unwrap().meta_region_total
    }

    pub fn mark_root_scanned(&self) {
        self.inner.lock().unwrap().root_scanned = true;
    }

    pub fn mark_meta_scanned(&self, region_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .metas_scanned
            .insert(region_name.to_string());
    }

    /// Gate for user-table operations: the root has been scanned and every
    /// known meta region is online and has been scanned at least once.
    pub fn all_metas_scanned(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.root_scanned
            && inner.online_metas.len() >= inner.meta_region_total
            && inner
                .online_metas
                .keys()
                .all(|name| inner.metas_scanned.contains(name))
    }

    /// Whether a region is mid-transition (anything but stably open).
    pub fn in_transition(&self, region_name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .regions
            .get(region_name)
            .map(|s| s.kind != RegionStateKind::Open)
            .unwrap_or(false)
    }

    /// Forcibly release every region associated with a server (crash or
    /// clean exit). Root and meta bookkeeping is detached as a side effect.
    /// Returns the number of regions released.
    pub fn release_server_regions(&self, addr: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .root_location
            .as_ref()
            .map(|s| s.addr == addr)
            .unwrap_or(false)
        {
            inner.root_location = None;
        }
        let meta_names: Vec<String> = inner
            .online_metas
            .iter()
            .filter(|(_, m)| m.server == addr)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &meta_names {
            inner.online_metas.remove(name);
        }
        inner.marked_to_close.remove(addr);
        let mut released = 0usize;
        for state in inner.regions.values_mut() {
            if state.server.as_ref().map(|s| s.addr == addr).unwrap_or(false) {
                state.kind = RegionStateKind::Unassigned;
                state.server = None;
                state.assigned_at = None;
                state.close_offline = false;
                state.close_reassign = true;
                released += 1;
            }
        }
        released
    }

    pub fn state_of(&self, region_name: &str) -> Option<(RegionStateKind, Option<ServerName>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .regions
            .get(region_name)
            .map(|s| (s.kind, s.server.clone()))
    }

    /// Regions currently open and served, for shutdown-progress logging.
    pub fn open_region_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .regions
            .values()
            .filter(|s| s.kind == RegionStateKind::Open)
            .count()
    }
}
