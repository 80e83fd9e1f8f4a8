//! Built-in miner - one proof per height for the local engine

use crate::config::MinerConfig;
use powchain_admission::{prepare_submission, ProblemInstance, ReferenceSolver, Solver, TierLimiter};
use powchain_codec::{Address, Epoch, ProblemRef};
use powchain_consensus::EngineHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

pub struct Miner {
    config: MinerConfig,
    address: Address,
    secret: Arc<Vec<u8>>,
    limiter: TierLimiter,
    engine: EngineHandle,
}

impl Miner {
    pub fn new(config: MinerConfig, address: Address, secret: Vec<u8>, engine: EngineHandle) -> Self {
        Self {
            config,
            address,
            secret: Arc::new(secret),
            limiter: TierLimiter::default(),
            engine,
        }
    }

    /// Mine on every new epoch until the engine goes away
    pub async fn run(self, solve_timeout: Duration) {
        let mut updates = self.engine.subscribe();
        tracing::info!(
            "Miner started ({:?}, {:?}, size {})",
            self.config.kind,
            self.config.tier,
            self.config.size
        );

        loop {
            let epoch = self.engine.epoch();
            if let Err(e) = self.mine_epoch(epoch, solve_timeout).await {
                tracing::debug!("Epoch {} not mined: {}", epoch.index, e);
            }
            if self.engine.is_halted() {
                break;
            }
            // Wait for the chain to move on
            match updates.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
        tracing::info!("Miner stopped");
    }

    async fn mine_epoch(&self, epoch: Epoch, solve_timeout: Duration) -> anyhow::Result<()> {
        let problem = ProblemRef {
            kind: self.config.kind,
            tier: self.config.tier,
            size: self.config.size,
            parent_hash: epoch.parent_hash,
            block_index: epoch.index,
        };
        let limits = *self.limiter.limits(problem.tier);
        let started = Instant::now();

        let instance = ProblemInstance::derive(&problem);
        let solution = tokio::task::spawn_blocking(move || {
            ReferenceSolver.solve(&instance, &limits, Instant::now() + solve_timeout)
        })
        .await??;

        if self.engine.epoch() != epoch {
            anyhow::bail!("chain moved on while solving");
        }

        let (commitment, reveal) =
            prepare_submission(&self.secret, self.address, problem, solution);
        self.engine.submit_commitment(&commitment)?;
        let best = self.engine.admit_reveal(reveal).await?;
        tracing::info!(
            "Mined height {} in {:?}{}",
            epoch.index,
            started.elapsed(),
            if best { "" } else { " (not the best proof)" }
        );
        Ok(())
    }
}
