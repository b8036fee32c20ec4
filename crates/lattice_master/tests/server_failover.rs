//! Dead-server recovery: a crashed server's regions converge onto a
//! survivor, its log is split exactly once, and the dead-server set drains.

mod common;

use std::time::Duration;

use common::{wait_until, TestCluster};
use lattice_master::catalog::{self, ColumnFamilyDescriptor, TableName};

#[tokio::test]
async fn dead_server_regions_converge_on_survivor() {
    let cluster = TestCluster::start("failover").await;
    let s1 = cluster.spawn_server(1, 100).await;

    let services = cluster.master.services();
    wait_until("catalog online on s1", Duration::from_secs(10), || {
        s1.serves_root() && services.assignment.all_metas_scanned()
    })
    .await;

    cluster
        .master
        .create_table(
            TableName("orders".into()),
            vec![ColumnFamilyDescriptor::new("d")],
        )
        .await
        .unwrap();
    let table = TableName("orders".into());
    wait_until("region open on s1", Duration::from_secs(10), || {
        s1.serves_table(&table)
    })
    .await;
    let region = s1.region_of_table(&table).unwrap();

    // A second server with spare capacity joins.
    let s2 = cluster.spawn_server(2, 100).await;
    wait_until("both servers live", Duration::from_secs(10), || {
        services.registry.live_count() == 2
    })
    .await;

    // s1 crashes: registration expires, network drops it.
    s1.kill().await;

    // Everything s1 served lands on s2, including the catalog regions.
    wait_until(
        "user region reassigned to s2",
        Duration::from_secs(15),
        || s2.serves_table(&table),
    )
    .await;
    wait_until("catalog reassigned to s2", Duration::from_secs(15), || {
        s2.serves_root() && s2.serves_meta()
    })
    .await;

    // Recovery completed: log split ran and the dead set drained.
    wait_until("dead set drained", Duration::from_secs(15), || {
        !services.registry.is_dead(&s1.name)
    })
    .await;
    assert!(!cluster.storage.server_log_exists(&s1.name));

    // The catalog row now records s2 with its start code.
    let meta = lattice_master::catalog::RegionDescriptor::first_meta();
    wait_until("catalog row points at s2", Duration::from_secs(15), || {
        s2.rs
            .row(&meta.encoded_name(), &region.name_bytes())
            .map(|cells| {
                cells.get(catalog::COL_SERVER).map(|v| v.as_ref())
                    == Some(s2.name.addr.as_bytes())
                    && cells.get(catalog::COL_STARTCODE).map(|v| v.as_ref())
                        == Some(s2.name.start_code.to_string().as_bytes())
            })
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn restarted_server_preempts_its_stale_registration() {
    let cluster = TestCluster::start("preempt").await;
    let s1 = cluster.spawn_server(1, 100).await;

    let services = cluster.master.services();
    wait_until("s1 live", Duration::from_secs(10), || {
        services.registry.live_count() == 1
    })
    .await;

    // Same host:port, newer start code: the old registration is expired and
    // the new process eventually registers.
    let s1b = cluster.spawn_server(1, 200).await;
    wait_until("new process live", Duration::from_secs(10), || {
        services.registry.is_live(&s1b.name.addr, Some(200))
    })
    .await;
    // The pre-empted process lands on the dead set until recovery runs.
    wait_until("stale process recovered", Duration::from_secs(15), || {
        !services.registry.is_dead(&s1.name)
    })
    .await;
}
