//! Shared in-process harness for integration tests: a running master over
//! the memory coordination service plus simulated region servers that
//! heartbeat for real and obey instructions.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lattice_master::catalog::{RegionDescriptor, TableName};
use lattice_master::connection::{MemoryCluster, MemoryRegionServer};
use lattice_master::coordination::{Coordinator, MemoryCoordinator};
use lattice_master::error::MasterError;
use lattice_master::load::ServerLoad;
use lattice_master::master::{Master, MasterConfig};
use lattice_master::registry::{Instruction, RegionReport, RegistryConfig, ServerName};
use lattice_master::storage::{LocalFsStorage, TableStorage};

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn test_config(identity: &str) -> MasterConfig {
    MasterConfig {
        identity: identity.to_string(),
        rescan_interval: Duration::from_millis(50),
        wake_interval: Duration::from_millis(20),
        requeue_delay: Duration::from_millis(30),
        retry_count: 3,
        retry_sleep: Duration::from_millis(10),
        min_live_servers: 1,
        max_logs_per_cleanup: 10,
        assignment_timeout: Duration::from_secs(2),
        registry: RegistryConfig {
            opening_backlog_threshold: 8,
            max_assignments_per_report: 4,
            report_interval: Duration::from_millis(20),
            balance_slop: 2,
        },
    }
}

pub struct TestCluster {
    pub coordinator: Arc<MemoryCoordinator>,
    pub network: Arc<MemoryCluster>,
    pub storage: Arc<LocalFsStorage>,
    pub master: Arc<Master>,
}

impl TestCluster {
    pub async fn start(tag: &str) -> Self {
        let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "lattice-it-{tag}-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let storage = Arc::new(LocalFsStorage::new(dir).unwrap());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let network = MemoryCluster::new();
        let master = Master::new(
            test_config("127.0.0.1:6000"),
            coordinator.clone(),
            network.clone(),
            storage.clone(),
        );
        {
            let master = master.clone();
            tokio::spawn(async move {
                if let Err(err) = master.run().await {
                    eprintln!("master exited with error: {err}");
                }
            });
        }
        let cluster = TestCluster {
            coordinator,
            network,
            storage,
            master,
        };
        cluster.wait_for_leader("127.0.0.1:6000").await;
        cluster
    }

    pub async fn wait_for_leader(&self, addr: &str) {
        let coordinator = self.coordinator.clone();
        let addr = addr.to_string();
        wait_until_async("master election", Duration::from_secs(5), move || {
            let coordinator = coordinator.clone();
            let addr = addr.clone();
            async move { coordinator.current_master().await.unwrap().as_deref() == Some(&addr) }
        })
        .await;
    }

    pub async fn spawn_server(&self, n: u64, start_code: u64) -> Arc<SimServer> {
        SimServer::start(self, n, start_code).await
    }
}

/// Simulated region server: registers, heartbeats, and obeys instructions.
pub struct SimServer {
    pub name: ServerName,
    pub rs: Arc<MemoryRegionServer>,
    master: Mutex<Arc<Master>>,
    storage: Arc<LocalFsStorage>,
    coordinator: Arc<MemoryCoordinator>,
    network: Arc<MemoryCluster>,
    served: Mutex<Vec<RegionDescriptor>>,
    outbox: Mutex<Vec<RegionReport>>,
    stopped: AtomicBool,
}

impl SimServer {
    pub async fn start(cluster: &TestCluster, n: u64, start_code: u64) -> Arc<Self> {
        let name = ServerName::new(format!("10.0.0.{n}:7200"), start_code);
        cluster.coordinator.register_server(&name).await.unwrap();
        let rs = MemoryRegionServer::new(name.addr.clone());
        rs.attach_storage(cluster.storage.clone());
        cluster.network.add_server(rs.clone());
        cluster.storage.ensure_server_log(&name).unwrap();

        loop {
            match cluster.master.region_server_startup(name.clone()).await {
                Ok(_) => break,
                Err(MasterError::PleaseHold(_)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(err) => panic!("server startup failed: {err}"),
            }
        }

        let server = Arc::new(SimServer {
            name,
            rs,
            master: Mutex::new(cluster.master.clone()),
            storage: cluster.storage.clone(),
            coordinator: cluster.coordinator.clone(),
            network: cluster.network.clone(),
            served: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(server.clone().run_loop());
        server
    }

    /// Point heartbeats at a different master (failover scenarios).
    pub fn retarget(&self, master: Arc<Master>) {
        *self.master.lock().unwrap() = master;
    }

    /// Hard crash: heartbeats stop, the network drops the server, and its
    /// ephemeral registration expires.
    pub async fn kill(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.network.remove_server(&self.name.addr);
        self.coordinator.expire_server(&self.name).await.unwrap();
    }

    pub fn served(&self) -> Vec<RegionDescriptor> {
        self.served.lock().unwrap().clone()
    }

    pub fn serves_root(&self) -> bool {
        self.served().iter().any(|r| r.is_root())
    }

    pub fn serves_meta(&self) -> bool {
        self.served().iter().any(|r| r.is_meta())
    }

    pub fn serves_table(&self, table: &TableName) -> bool {
        self.served().iter().any(|r| &r.table == table)
    }

    pub fn region_of_table(&self, table: &TableName) -> Option<RegionDescriptor> {
        self.served().into_iter().find(|r| &r.table == table)
    }

    pub fn report(&self, msg: RegionReport) {
        self.outbox.lock().unwrap().push(msg);
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
            let messages: Vec<RegionReport> = {
                let mut outbox = self.outbox.lock().unwrap();
                outbox.drain(..).collect()
            };
            let load = ServerLoad::new(self.served.lock().unwrap().len() as u32, 1);
            let master = self.master.lock().unwrap().clone();
            match master
                .region_server_report(self.name.clone(), load, messages.clone(), vec![])
                .await
            {
                Ok(instructions) => {
                    for instruction in instructions {
                        self.apply(instruction);
                    }
                }
                Err(_) => {
                    // Master unavailable mid-transition; keep the messages
                    // for the next heartbeat.
                    let mut outbox = self.outbox.lock().unwrap();
                    let mut retained = messages;
                    retained.extend(outbox.drain(..));
                    *outbox = retained;
                }
            }
        }
    }

    fn apply(&self, instruction: Instruction) {
        match instruction {
            Instruction::Open { region } => self.open_region(region),
            Instruction::Close { region, report } => self.close_region(&region, report),
            Instruction::Stop => {
                self.stopped.store(true, Ordering::SeqCst);
            }
            Instruction::Quiesce => {
                let user: Vec<RegionDescriptor> = self
                    .served()
                    .into_iter()
                    .filter(|r| !r.is_catalog())
                    .collect();
                for region in user {
                    self.close_region(&region, true);
                }
                self.report(RegionReport::Quiesced);
            }
        }
    }

    fn open_region(&self, region: RegionDescriptor) {
        if region.is_catalog() {
            let rows = self.storage.load_region_rows(&region).unwrap_or_default();
            self.rs.host_catalog_region(region.clone(), rows);
        } else {
            self.rs.serve_region(region.clone());
        }
        self.served.lock().unwrap().push(region.clone());
        self.report(RegionReport::Opened(region));
    }

    fn close_region(&self, region: &RegionDescriptor, report: bool) {
        self.rs.drop_region(region);
        self.served
            .lock()
            .unwrap()
            .retain(|r| r.name() != region.name());
        if report {
            self.report(RegionReport::Closed {
                region: region.clone(),
                message: None,
            });
        }
    }
}

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async-condition variant of `wait_until`.
pub async fn wait_until_async<F, Fut>(what: &str, timeout: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
