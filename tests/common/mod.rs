//! Helpers shared by the integration suites

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use xlb::{Client, Cluster, Config, ConfigBuilder, ServerStats, WorkType, WorkUnit};

/// Fast timers, no process exit on abort
pub fn config(workers: usize, servers: usize, types: &[WorkType]) -> Config {
    ConfigBuilder::from_config(Config::development())
        .workers(workers)
        .servers(servers)
        .work_types(types.iter().copied())
        .build()
        .unwrap()
}

/// Fail the test instead of hanging when termination never happens
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("run did not finish in time")
}

/// Take every unit of `work_type` until the run shuts down, then finalize
pub async fn work_until_shutdown(
    mut client: Client,
    work_type: WorkType,
) -> xlb::Result<Vec<WorkUnit>> {
    let mut units = Vec::new();
    loop {
        match client.get(work_type).await {
            Ok(unit) => units.push(unit),
            Err(e) if e.is_shutdown() => break,
            Err(e) => return Err(e),
        }
    }
    client.finalize().await?;
    Ok(units)
}

/// Park every client until shutdown and wait for the servers
pub async fn finish(cluster: Cluster, clients: Vec<Client>, work_type: WorkType) -> Vec<ServerStats> {
    let workers: Vec<_> = clients
        .into_iter()
        .map(|c| tokio::spawn(work_until_shutdown(c, work_type)))
        .collect();
    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    cluster.join().await.unwrap()
}
