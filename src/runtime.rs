use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::client::Client;
use crate::core::config::Config;
use crate::core::errors::{Result, XlbError};
use crate::core::layout::{Layout, Rank};
use crate::server::{Server, ServerStats};
use crate::transport::{LocalEndpoint, LocalFabric, Transport};

/// The worker ranks of a run and a barrier among them
#[derive(Debug, Clone)]
pub struct WorkerGroup {
    ranks: Vec<Rank>,
    barrier: Arc<Barrier>,
}

impl WorkerGroup {
    pub fn new(nworkers: usize) -> Self {
        Self {
            ranks: (0..nworkers).collect(),
            barrier: Arc::new(Barrier::new(nworkers.max(1))),
        }
    }

    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Wait until every worker reached the barrier
    pub async fn barrier(&self) {
        self.barrier.wait().await;
    }
}

/// What a rank turned out to be after [`init`]
pub enum Role<T: Transport = LocalEndpoint> {
    Server(Server<T>),
    Worker(Client<T>),
}

/// Decide the role of this endpoint's rank and build it
pub fn init<T: Transport>(transport: T, config: Arc<Config>, group: WorkerGroup) -> Result<Role<T>> {
    config.validate()?;
    if transport.size() != config.size() {
        return Err(XlbError::configuration(format!(
            "transport has {} ranks, configuration expects {}",
            transport.size(),
            config.size()
        )));
    }
    let layout = Layout::new(config.nworkers, config.nservers);
    if layout.is_server(transport.rank()) {
        Ok(Role::Server(Server::new(transport, config)?))
    } else {
        Ok(Role::Worker(Client::new(transport, config, group)))
    }
}

/// A whole run inside one process: servers spawned as tokio tasks, one
/// [`Client`] per worker rank handed back to the caller.
pub struct Cluster {
    run_id: Uuid,
    clients: Vec<Client>,
    servers: Vec<JoinHandle<Result<ServerStats>>>,
}

impl Cluster {
    /// Start all servers; must be called from within a tokio runtime
    pub fn launch(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let run_id = Uuid::new_v4();
        let (_fabric, endpoints) = LocalFabric::new(config.size());
        let group = WorkerGroup::new(config.nworkers);

        let mut clients = Vec::with_capacity(config.nworkers);
        let mut servers = Vec::with_capacity(config.nservers);
        for endpoint in endpoints {
            match init(endpoint, config.clone(), group.clone())? {
                Role::Server(server) => servers.push(tokio::spawn(server.run())),
                Role::Worker(client) => clients.push(client),
            }
        }
        info!(
            "Run {} launched: {} workers, {} servers",
            run_id, config.nworkers, config.nservers
        );
        Ok(Self {
            run_id,
            clients,
            servers,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Take the worker clients, ordered by rank
    pub fn clients(&mut self) -> Vec<Client> {
        std::mem::take(&mut self.clients)
    }

    /// Wait for every server to exit; the first failure wins
    pub async fn join(self) -> Result<Vec<ServerStats>> {
        let results = join_all(self.servers).await;
        let mut stats = Vec::with_capacity(results.len());
        for result in results {
            let server = result.map_err(|e| XlbError::internal(format!("server task failed: {}", e)))?;
            stats.push(server?);
        }
        info!("Run {} finished", self.run_id);
        Ok(stats)
    }
}
