//! Live/dead server registry and the heartbeat protocol.
//!
//! Heartbeats carry embedded region-state messages which are converted into
//! queued operations here; the response carries instructions back to the
//! server. Death watches on the coordination service feed the dead-server
//! set and enqueue shutdown recovery. State is guarded by one coarse lock;
//! network calls (the split-daughter idempotence check) happen outside it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assignment::{AssignmentState, OpenDisposition};
use crate::catalog::{decode_row, RegionDescriptor, RowContent};
use crate::coordination::Coordinator;
use crate::error::{MasterError, Result};
use crate::load::{average_regions, ServerLoad};
use crate::operations::{Operation, ShutdownRecovery};
use crate::queue::OperationQueue;
use crate::retry::{CatalogAccess, CatalogTarget};

/// Unique server identity: address plus a monotonically increasing start
/// code distinguishing successive processes on the same host:port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerName {
    pub addr: String,
    pub start_code: u64,
}

impl ServerName {
    pub fn new(addr: impl Into<String>, start_code: u64) -> Self {
        ServerName {
            addr: addr.into(),
            start_code,
        }
    }

    /// Filesystem-safe rendering used for log directory names.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.addr.replace(':', "_"), self.start_code)
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.addr, self.start_code)
    }
}

/// Region-state messages embedded in a heartbeat, processed in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionReport {
    Opened(RegionDescriptor),
    Closed {
        region: RegionDescriptor,
        message: Option<String>,
    },
    Split {
        parent: RegionDescriptor,
        daughter_a: RegionDescriptor,
        daughter_b: RegionDescriptor,
    },
    /// Server finished quiescing for cluster shutdown.
    Quiesced,
    /// Server is ending its session cleanly.
    Exiting,
}

/// Per-element heartbeat response instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Identity or start code no longer matches registry records.
    Stop,
    /// Cluster shutdown in progress; close user regions and report back.
    Quiesce,
    /// Close a region. `report: false` suppresses the close report (used to
    /// correct a duplicate open without a spurious CLOSED transition).
    Close {
        region: RegionDescriptor,
        report: bool,
    },
    Open {
        region: RegionDescriptor,
    },
}

/// Config subset handed to a server at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    pub report_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Skip new assignments while a server has at least this many opens in
    /// flight.
    pub opening_backlog_threshold: usize,
    /// Cap on user-region assignments handed out per heartbeat.
    pub max_assignments_per_report: usize,
    pub report_interval: Duration,
    /// Regions above the cluster average before load shedding kicks in.
    pub balance_slop: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            opening_backlog_threshold: 8,
            max_assignments_per_report: 4,
            report_interval: Duration::from_secs(3),
            balance_slop: 2,
        }
    }
}

struct LiveServer {
    name: ServerName,
    load: ServerLoad,
    pending_opens: BTreeSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    live: HashMap<String, LiveServer>,
    dead: HashSet<ServerName>,
    quiesced: BTreeSet<String>,
}

pub struct ServerRegistry {
    inner: Mutex<RegistryInner>,
    assignment: Arc<AssignmentState>,
    queue: Arc<OperationQueue>,
    coordinator: Arc<dyn Coordinator>,
    catalog: Arc<CatalogAccess>,
    config: RegistryConfig,
    shutdown_requested: Arc<AtomicBool>,
    /// Handle to ourselves for the spawned death-watch tasks.
    self_ref: Mutex<Weak<ServerRegistry>>,
}

impl ServerRegistry {
    pub fn new(
        assignment: Arc<AssignmentState>,
        queue: Arc<OperationQueue>,
        coordinator: Arc<dyn Coordinator>,
        catalog: Arc<CatalogAccess>,
        config: RegistryConfig,
        shutdown_requested: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let registry = Arc::new(ServerRegistry {
            inner: Mutex::new(RegistryInner::default()),
            assignment,
            queue,
            coordinator,
            catalog,
            config,
            shutdown_requested,
            self_ref: Mutex::new(Weak::new()),
        });
        *registry.self_ref.lock().unwrap() = Arc::downgrade(&registry);
        registry
    }

    /// Register a starting server. The server must already hold its
    /// ephemeral registration on the coordination service; a death watch is
    /// installed against it here.
    pub async fn startup(&self, name: ServerName) -> Result<StartupConfig> {
        let existing_code = {
            let mut inner = self.inner.lock().unwrap();
            if inner.dead.contains(&name) {
                return Err(MasterError::ServerDead(name.to_string()));
            }
            match inner.live.get(&name.addr).map(|s| s.name.start_code) {
                None => {
                    inner.live.insert(
                        name.addr.clone(),
                        LiveServer {
                            name: name.clone(),
                            load: ServerLoad::default(),
                            pending_opens: BTreeSet::new(),
                        },
                    );
                    self.install_watch(name.clone());
                    return Ok(StartupConfig {
                        report_interval: self.config.report_interval,
                    });
                }
                Some(code) => code,
            }
        };

        if existing_code < name.start_code {
            // A newer process on the same host:port pre-empts the old
            // registration; expire it asynchronously and tell the new one
            // to hold until the expiry has propagated.
            let stale = ServerName::new(name.addr.clone(), existing_code);
            tracing::info!(server = %stale, "expiring pre-empted registration");
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                if let Err(err) = coordinator.expire_server(&stale).await {
                    tracing::warn!(error = %err, server = %stale, "failed to expire stale registration");
                }
            });
            return Err(MasterError::PleaseHold(name.addr));
        }
        if existing_code > name.start_code {
            return Err(MasterError::ServerDead(name.to_string()));
        }
        // Same process re-registering after a hiccup.
        Ok(StartupConfig {
            report_interval: self.config.report_interval,
        })
    }

    /// Adopt an already-running server during failover join.
    pub fn record_live(&self, name: ServerName, load: ServerLoad) {
        let mut inner = self.inner.lock().unwrap();
        inner.live.insert(
            name.addr.clone(),
            LiveServer {
                name: name.clone(),
                load,
                pending_opens: BTreeSet::new(),
            },
        );
        drop(inner);
        self.install_watch(name);
    }

    fn install_watch(&self, name: ServerName) {
        let Some(registry) = self.self_ref.lock().unwrap().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let watch = match registry.coordinator.watch_server(&name).await {
                Ok(watch) => watch,
                Err(err) => {
                    tracing::warn!(error = %err, server = %name, "failed to install death watch");
                    return;
                }
            };
            watch.fired().await;
            registry.server_expired(name);
        });
    }

    /// Death-watch firing: idempotent move into the dead set plus a queued
    /// shutdown recovery. Watches left over from clean exits or pre-empted
    /// registrations find the server gone and do nothing.
    pub fn server_expired(&self, name: ServerName) {
        {
            let mut inner = self.inner.lock().unwrap();
            let registered = inner
                .live
                .get(&name.addr)
                .map(|s| s.name == name)
                .unwrap_or(false);
            if !registered {
                return;
            }
            inner.live.remove(&name.addr);
            if !inner.dead.insert(name.clone()) {
                return;
            }
            inner.quiesced.remove(&name.addr);
        }
        tracing::warn!(server = %name, "server registration expired, scheduling shutdown recovery");
        self.queue
            .submit(Operation::ServerShutdown(ShutdownRecovery::new(name)));
    }

    /// Process one heartbeat. Returns the instruction set for the server.
    pub async fn report(
        &self,
        name: ServerName,
        load: ServerLoad,
        messages: Vec<RegionReport>,
        hot_regions: Vec<RegionDescriptor>,
    ) -> Result<Vec<Instruction>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.dead.contains(&name) {
                return Err(MasterError::ServerDead(name.to_string()));
            }
            match inner.live.get_mut(&name.addr) {
                None => return Ok(vec![Instruction::Stop]),
                Some(s) if s.name.start_code != name.start_code => {
                    return Ok(vec![Instruction::Stop]);
                }
                Some(s) => s.load = load,
            }
        }

        if messages.contains(&RegionReport::Exiting) {
            self.process_exit(&name, &messages);
            return Ok(Vec::new());
        }

        let mut instructions = Vec::new();
        let mut splits = Vec::new();
        for msg in messages {
            if !self.queue.allow_message(&name, &msg) {
                tracing::debug!(server = %name, "heartbeat message vetoed by listener");
                continue;
            }
            match msg {
                RegionReport::Opened(region) => {
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if let Some(s) = inner.live.get_mut(&name.addr) {
                            s.pending_opens.remove(&region.name());
                        }
                    }
                    match self.assignment.open_disposition(&region, &name) {
                        OpenDisposition::Expected => {
                            self.queue.submit(Operation::OpenReport {
                                server: name.clone(),
                                region,
                            });
                        }
                        OpenDisposition::Duplicate => {
                            tracing::warn!(
                                server = %name,
                                region = %region,
                                "duplicate open report, instructing close without report"
                            );
                            instructions.push(Instruction::Close {
                                region,
                                report: false,
                            });
                        }
                    }
                }
                RegionReport::Closed { region, message } => {
                    if let Some(message) = &message {
                        tracing::info!(server = %name, region = %region, message = %message, "region closed");
                    }
                    let (offline, reassign) = self.assignment.close_intent(&region);
                    self.assignment.report_closed(&region);
                    self.queue.submit(Operation::CloseReport {
                        region,
                        offline,
                        reassign,
                    });
                }
                RegionReport::Split {
                    parent,
                    daughter_a,
                    daughter_b,
                } => splits.push((parent, daughter_a, daughter_b)),
                RegionReport::Quiesced => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.quiesced.insert(name.addr.clone());
                }
                RegionReport::Exiting => unreachable!("handled above"),
            }
        }

        // Daughter-assignment checks hit the catalog; keep them outside the
        // registry lock.
        for (parent, a, b) in splits {
            self.process_split(&name, parent, a, b).await;
        }

        if self.shutdown_requested.load(Ordering::SeqCst) {
            let quiesced = {
                let inner = self.inner.lock().unwrap();
                inner.quiesced.contains(&name.addr)
            };
            if !quiesced {
                instructions.push(Instruction::Quiesce);
            }
            for region in self.assignment.take_marked_to_close(&name.addr) {
                instructions.push(Instruction::Close {
                    region,
                    report: true,
                });
            }
            return Ok(instructions);
        }

        for region in self.assignment.take_marked_to_close(&name.addr) {
            instructions.push(Instruction::Close {
                region,
                report: true,
            });
        }

        let backlog = {
            let inner = self.inner.lock().unwrap();
            inner
                .live
                .get(&name.addr)
                .map(|s| s.pending_opens.len())
                .unwrap_or(0)
        };
        if backlog >= self.config.opening_backlog_threshold {
            tracing::debug!(server = %name, backlog, "open backlog, skipping new assignments");
            return Ok(instructions);
        }

        let batch = self
            .assignment
            .assign_batch(&name, self.config.max_assignments_per_report);
        if !batch.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            if let Some(s) = inner.live.get_mut(&name.addr) {
                for region in &batch {
                    s.pending_opens.insert(region.name());
                }
            }
        }
        for region in batch {
            tracing::info!(server = %name, region = %region, "assigning region");
            instructions.push(Instruction::Open { region });
        }

        if instructions.is_empty() {
            self.maybe_shed_load(&name, &hot_regions, &mut instructions);
        }

        Ok(instructions)
    }

    /// With nothing to assign, shed regions from a server loaded well above
    /// the cluster average so they land somewhere lighter.
    fn maybe_shed_load(
        &self,
        name: &ServerName,
        hot_regions: &[RegionDescriptor],
        instructions: &mut Vec<Instruction>,
    ) {
        let (regions, avg) = {
            let inner = self.inner.lock().unwrap();
            let Some(s) = inner.live.get(&name.addr) else {
                return;
            };
            (
                s.load.regions,
                average_regions(inner.live.values().map(|s| &s.load)),
            )
        };
        let threshold = avg.ceil() as u32 + self.config.balance_slop;
        if regions <= threshold {
            return;
        }
        let excess = (regions - threshold) as usize;
        for region in hot_regions
            .iter()
            .filter(|r| !r.is_catalog() && !self.assignment.in_transition(&r.name()))
            .take(excess)
        {
            tracing::info!(server = %name, region = %region, "shedding region for rebalance");
            self.assignment.mark_close(name, region, false, true);
        }
        for region in self.assignment.take_marked_to_close(&name.addr) {
            instructions.push(Instruction::Close {
                region,
                report: true,
            });
        }
    }

    /// Clean session end: closed regions are released for reassignment
    /// (unless the whole cluster is coming down) and the server leaves the
    /// registry without shutdown recovery.
    fn process_exit(&self, name: &ServerName, messages: &[RegionReport]) {
        let shutting_down = self.shutdown_requested.load(Ordering::SeqCst);
        tracing::info!(server = %name, shutting_down, "server exiting cleanly");
        for msg in messages {
            if let RegionReport::Closed { region, .. } = msg {
                self.assignment.report_closed(region);
                if !shutting_down {
                    self.assignment.set_unassigned(region.clone());
                }
            }
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.live.remove(&name.addr);
            inner.quiesced.insert(name.addr.clone());
        }
        // Anything still mid-transition on this server goes back to
        // unassigned; root/meta bookkeeping is detached alongside.
        let released = self.assignment.release_server_regions(&name.addr);
        if released > 0 && !shutting_down {
            tracing::info!(server = %name, released, "released in-transition regions from exiting server");
        }
    }

    /// Split report: the parent is done serving, both daughters are assigned
    /// unless their catalog rows show an existing assignment (idempotence
    /// against replayed split reports).
    async fn process_split(
        &self,
        name: &ServerName,
        parent: RegionDescriptor,
        daughter_a: RegionDescriptor,
        daughter_b: RegionDescriptor,
    ) {
        tracing::info!(
            server = %name,
            parent = %parent,
            daughter_a = %daughter_a,
            daughter_b = %daughter_b,
            "region split reported"
        );
        self.assignment.remove_region(&parent);
        if parent.is_meta() {
            self.assignment.note_meta_split();
        }
        for daughter in [daughter_a, daughter_b] {
            if self.daughter_already_assigned(&daughter).await {
                tracing::debug!(region = %daughter, "daughter already assigned, skipping");
                continue;
            }
            self.assignment.set_unassigned(daughter);
        }
    }

    async fn daughter_already_assigned(&self, daughter: &RegionDescriptor) -> bool {
        let target = if daughter.is_meta() {
            CatalogTarget::Root
        } else {
            CatalogTarget::MetaRowOf(daughter.name_bytes())
        };
        match self.catalog.get_row(&target, &daughter.name_bytes()).await {
            Ok(Some(Some(cells))) => match decode_row(&cells) {
                RowContent::Region(row) => row.server.is_some() && row.start_code.is_some(),
                RowContent::Empty => false,
            },
            Ok(Some(None)) => false,
            Ok(None) => true, // shutting down; do nothing
            Err(err) => {
                tracing::warn!(error = %err, region = %daughter, "daughter assignment check failed, assigning anyway");
                false
            }
        }
    }

    pub fn is_live(&self, addr: &str, start_code: Option<u64>) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.live.get(addr) {
            Some(s) => start_code.map(|c| s.name.start_code == c).unwrap_or(true),
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn live_servers(&self) -> Vec<ServerName> {
        let mut servers: Vec<ServerName> = self
            .inner
            .lock()
            .unwrap()
            .live
            .values()
            .map(|s| s.name.clone())
            .collect();
        servers.sort();
        servers
    }

    pub fn is_dead(&self, name: &ServerName) -> bool {
        self.inner.lock().unwrap().dead.contains(name)
    }

    /// Shutdown recovery finished; the server may rejoin with a new start
    /// code from here on.
    pub fn clear_dead(&self, name: &ServerName) {
        self.inner.lock().unwrap().dead.remove(name);
    }

    /// All live servers have quiesced (vacuously true with none left).
    pub fn all_quiesced(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .live
            .keys()
            .all(|addr| inner.quiesced.contains(addr))
    }
}
