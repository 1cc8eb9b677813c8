//! Per-block driver of every active payment session.

use std::{fmt, sync::Arc};

use bitcoin::{BlockHash, Network};
use rand::seq::SliceRandom;
use tokio::time::sleep;
use tracing::*;
use tumbler_db::SledRepository;
use tumbler_primitives::{Height, ProtocolParameters};
use tumbler_tasks::{ServiceHandle, ShutdownGuard, TaskError};
use tumbler_wallet::{
    Broadcaster, FundingBatch, FundingRunner, ReclaimBatch, ReclaimRunner, WalletClient,
};

use crate::{
    chain::{BlockExplorer, BlockRef, ChainOracle},
    config::{ClientConfig, ExecutorConfig},
    progress::{JsonFileProgressSink, ProgressInfo, ProgressSink},
    protocol::TumblerProtocolClient,
    services::SessionServices,
    session::{FailureKind, PaymentError, PaymentStateMachine, PaymentStatus},
    store::CycleStore,
};

/// Confirmations a coin needs to count towards the balance that gates joining
/// a cycle.
const BALANCE_MIN_CONFIRMATIONS: u32 = 1;

/// Counts consecutive invalid-phase failures across machines.
///
/// A couple of them are expected when the tumbler sees a block slightly later
/// than we do.
#[derive(Debug)]
pub struct InvalidPhaseTracker {
    consecutive: u32,
    threshold: u32,
}

impl InvalidPhaseTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Records a failure. Returns true once the streak exceeds the threshold.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive > self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// What the driver loop is doing right now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopState {
    Idle,
    AwaitingPropagation,
    ProcessingCycles,
    Stopped,
}

/// Collaborators of the executor.
#[derive(Clone)]
pub struct ExecutorContext {
    pub config: ExecutorConfig,
    pub network: Network,
    pub chain: Arc<dyn ChainOracle>,
    pub wallet: Arc<dyn WalletClient>,
    pub store: CycleStore,
    pub services: SessionServices,
    pub progress: Arc<dyn ProgressSink>,
}

impl ExecutorContext {
    /// Opens the session store and the progress file under the configured
    /// datadir and builds both batches on top of `wallet` and `broadcaster`.
    pub fn from_config<W: WalletClient, B: Broadcaster>(
        config: &ClientConfig,
        params: Arc<ProtocolParameters>,
        chain: Arc<dyn ChainOracle>,
        wallet: Arc<W>,
        broadcaster: Arc<B>,
        tumbler: Arc<dyn TumblerProtocolClient>,
        explorer: Arc<dyn BlockExplorer>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if params.network != config.network {
            anyhow::bail!(
                "tumbler parameters are for {}, client is configured for {}",
                params.network,
                config.network
            );
        }

        let repo = SledRepository::open(config.db_path())?;
        let fee_rate = config.batch.fee_rate()?;
        let batch = config.batch.batch_config();
        let funder = FundingBatch::new(
            FundingRunner::new(wallet.clone(), broadcaster.clone(), fee_rate),
            batch,
        );
        let reclaimer = ReclaimBatch::new(
            ReclaimRunner::new(wallet.clone(), broadcaster, fee_rate),
            batch,
        );
        info!(
            datadir = %config.datadir.display(),
            network = %config.network,
            %fee_rate,
            "executor context ready"
        );

        Ok(Self {
            config: config.executor.clone(),
            network: config.network,
            chain,
            wallet,
            store: CycleStore::new(Arc::new(repo)),
            services: SessionServices {
                params,
                tumbler,
                explorer,
                funder: Arc::new(funder),
                reclaimer: Arc::new(reclaimer),
                confirmations: config.executor.confirmation_targets(),
            },
            progress: Arc::new(JsonFileProgressSink::new(config.progress_path())),
        })
    }
}

impl fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("config", &self.config)
            .field("network", &self.network)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct StateMachineExecutor {
    ctx: ExecutorContext,
    last_seen: Option<BlockHash>,
    last_started_cycle: Option<Height>,
    invalid_phase: InvalidPhaseTracker,
    state: LoopState,
}

impl StateMachineExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        let threshold = ctx.config.invalid_phase_warn_threshold;
        Self {
            ctx,
            last_seen: None,
            last_started_cycle: None,
            invalid_phase: InvalidPhaseTracker::new(threshold),
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn invalid_phase(&self) -> &InvalidPhaseTracker {
        &self.invalid_phase
    }

    /// Starts the driver loop on its own task.
    pub fn spawn(self) -> ExecutorHandle {
        ExecutorHandle {
            inner: ServiceHandle::spawn("state-machine-executor", |guard| self.run(guard)),
        }
    }

    async fn run(mut self, guard: ShutdownGuard) {
        info!("state machine executor started");

        loop {
            self.state = LoopState::Idle;
            let block = tokio::select! {
                _ = guard.wait_for_shutdown() => break,
                res = self.ctx.chain.wait_for_block_after(self.last_seen) => res,
            };

            let res = match block {
                Ok(block) => self.process_block(block, &guard).await,
                Err(e) => Err(e.into()),
            };

            match res {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    error!(?err, "executor iteration failed");
                    tokio::select! {
                        _ = guard.wait_for_shutdown() => break,
                        _ = sleep(self.ctx.config.error_backoff()) => {}
                    }
                }
            }

            if guard.should_shutdown() {
                break;
            }
        }

        self.state = LoopState::Stopped;
        info!("state machine executor stopped");
    }

    /// Handles one new block. Returns `None` if shutdown interrupted the
    /// propagation delay.
    pub async fn process_block(
        &mut self,
        block: BlockRef,
        guard: &ShutdownGuard,
    ) -> anyhow::Result<Option<ProgressInfo>> {
        let span = info_span!("executor_iteration", height = block.height);
        self.process_block_inner(block, guard).instrument(span).await
    }

    async fn process_block_inner(
        &mut self,
        block: BlockRef,
        guard: &ShutdownGuard,
    ) -> anyhow::Result<Option<ProgressInfo>> {
        let height = block.height;
        self.last_seen = Some(block.hash);
        debug!(hash = %block.hash, "new block");

        self.maybe_start_cycle(height).await?;

        let mut machines = self.load_active(height)?;
        machines.shuffle(&mut rand::thread_rng());

        self.state = LoopState::AwaitingPropagation;
        let delay = self.ctx.config.propagation_delay(self.ctx.network);
        tokio::select! {
            _ = guard.wait_for_shutdown() => return Ok(None),
            _ = sleep(delay) => {}
        }

        self.state = LoopState::ProcessingCycles;
        for machine in machines.iter_mut() {
            if machine.status() == PaymentStatus::Wasted {
                continue;
            }

            let start = machine.cycle().start;
            let res = machine
                .update(height, &self.ctx.services)
                .instrument(debug_span!("cycle", %start))
                .await;

            let premature = match res {
                Ok(_) => {
                    self.invalid_phase.record_success();
                    false
                }
                Err(err) => self.handle_update_error(start, &err),
            };

            if machine.need_save() {
                self.ctx.store.save(machine.record())?;
                machine.mark_saved();
            }

            if premature {
                break;
            }
        }

        let mut cycles: Vec<_> = machines.iter().map(|m| m.progress(height)).collect();
        cycles.sort_by_key(|c| c.start);
        let info = ProgressInfo { height, cycles };
        if let Err(err) = self.ctx.progress.publish(&info) {
            warn!(%err, "failed to publish progress");
        }

        Ok(Some(info))
    }

    /// Logs a failed update. Returns true if the rest of this block's cycles
    /// should be skipped.
    fn handle_update_error(&mut self, start: Height, err: &PaymentError) -> bool {
        match err.kind() {
            FailureKind::PrematureRequest => {
                info!(
                    cycle = start,
                    "tumbler transport is not ready yet, skipping to the next block"
                );
                true
            }
            FailureKind::InvalidPhase => {
                if self.invalid_phase.record_failure() {
                    error!(
                        cycle = start,
                        consecutive = self.invalid_phase.consecutive(),
                        %err,
                        "tumbler keeps disagreeing on the cycle phase, check the local clock and chain view"
                    );
                } else {
                    info!(cycle = start, %err, "tumbler disagrees on the cycle phase");
                }
                false
            }
            FailureKind::Other => {
                error!(cycle = start, %err, "session update failed");
                false
            }
        }
    }

    /// Creates a session for the cycle registering at `height`, once per
    /// cycle, if the wallet can afford it.
    async fn maybe_start_cycle(&mut self, height: Height) -> anyhow::Result<()> {
        let params = &self.ctx.services.params;
        let Some(cycle) = params.cycle_generator.registering_cycle(height) else {
            return Ok(());
        };
        if self.last_started_cycle == Some(cycle.start) {
            return Ok(());
        }
        // a record from other parameters counts as absent and gets replaced
        if let Some(record) = self.ctx.store.load(cycle.start)? {
            if PaymentStateMachine::resume(params, record).is_some() {
                self.last_started_cycle = Some(cycle.start);
                return Ok(());
            }
        }

        let needed = params.funding_amount();
        let balance = self
            .ctx
            .wallet
            .spendable_balance(BALANCE_MIN_CONFIRMATIONS)
            .await?;
        if balance < needed {
            debug!(cycle = cycle.start, %balance, %needed, "not enough funds to join cycle");
            return Ok(());
        }

        let machine = PaymentStateMachine::new(params, cycle);
        self.ctx.store.save(machine.record())?;
        self.last_started_cycle = Some(cycle.start);
        info!(cycle = cycle.start, "joined new cycle");
        Ok(())
    }

    /// Sessions of all cycles running at `height` that were made under the
    /// current parameters.
    fn load_active(&self, height: Height) -> anyhow::Result<Vec<PaymentStateMachine>> {
        let params = &self.ctx.services.params;
        let mut machines = Vec::new();
        for cycle in params.cycle_generator.active_cycles(height) {
            let Some(record) = self.ctx.store.load(cycle.start)? else {
                continue;
            };
            match PaymentStateMachine::resume(params, record) {
                Some(machine) => machines.push(machine),
                None => debug!(cycle = cycle.start, "ignoring session from other parameters"),
            }
        }
        Ok(machines)
    }
}

/// Owns the running executor task.
#[derive(Debug)]
pub struct ExecutorHandle {
    inner: ServiceHandle<()>,
}

impl ExecutorHandle {
    pub fn is_running(&self) -> bool {
        !self.inner.is_finished()
    }

    /// Signals shutdown and waits for the loop to exit.
    pub async fn stop(self) -> Result<(), TaskError> {
        self.inner.stop().await
    }
}
