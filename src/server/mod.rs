// Server role: event loop around a per-server context

pub mod context;
pub mod stats;
pub mod termination;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};

use crate::core::config::Config;
use crate::core::errors::{Result, XlbError};
use crate::core::layout::Rank;
use crate::transport::{Envelope, LocalEndpoint, Transport};

pub use context::{Flow, ServerContext, WorkerState};
pub use stats::ServerStats;
pub use termination::{TerminationDetector, Verdict};

enum Wakeup {
    Inbound(Result<Envelope>),
    Steal,
    Idle,
}

/// A server rank: owns its context and drives it from the transport
pub struct Server<T: Transport = LocalEndpoint> {
    transport: T,
    context: ServerContext,
    config: Arc<Config>,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, config: Arc<Config>) -> Result<Self> {
        if transport.size() != config.size() {
            return Err(XlbError::configuration(format!(
                "transport has {} ranks but the configuration describes {}",
                transport.size(),
                config.size()
            )));
        }
        let context = ServerContext::new(transport.rank(), config.clone())?;
        Ok(Self {
            transport,
            context,
            config,
        })
    }

    pub fn rank(&self) -> Rank {
        self.context.rank()
    }

    /// Serve until coordinated shutdown completes or the run is aborted
    pub async fn run(self) -> Result<ServerStats> {
        let span = info_span!("server", rank = self.rank());
        self.serve().instrument(span).await
    }

    async fn serve(mut self) -> Result<ServerStats> {
        info!("Server started");
        let steal_period = self.config.steal_interval;
        // spread the servers' probes so they do not fire in lockstep
        let jitter = Duration::from_micros(fastrand::u64(0..=steal_period.as_micros() as u64));
        let mut steal_tick = interval_at(Instant::now() + jitter, steal_period);
        steal_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_tick = interval_at(
            Instant::now() + self.config.idle_check_interval,
            self.config.idle_check_interval,
        );
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wakeup = tokio::select! {
                inbound = self.transport.recv() => Wakeup::Inbound(inbound),
                _ = steal_tick.tick() => Wakeup::Steal,
                _ = idle_tick.tick() => Wakeup::Idle,
            };

            let flow = match wakeup {
                Wakeup::Inbound(Ok(envelope)) => self.context.handle(envelope),
                Wakeup::Inbound(Err(e)) if e.category() == "serialization" => {
                    warn!("Dropping malformed message: {}", e);
                    Flow::Continue
                }
                Wakeup::Inbound(Err(e)) => {
                    error!("Transport failed: {}", e);
                    return Err(e);
                }
                Wakeup::Steal => self.context.on_steal_tick(),
                Wakeup::Idle => self.context.on_idle_tick(),
            };
            self.flush().await;

            match flow {
                Flow::Continue => {}
                Flow::Exit => break,
                Flow::Abort(code) => return Err(XlbError::Aborted { code }),
            }
        }

        let stats = self.context.finish();
        match serde_json::to_string(&stats) {
            Ok(json) => info!("Server finished: {}", json),
            Err(e) => warn!("Cannot serialize server stats: {}", e),
        }
        Ok(stats)
    }

    async fn flush(&mut self) {
        for (to, message) in self.context.take_outbox() {
            if let Err(e) = self.transport.send(to, &message).await {
                warn!("Send to rank {} failed: {}", to, e);
            }
        }
    }
}
