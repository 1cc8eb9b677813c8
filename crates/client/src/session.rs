//! Per-cycle payment session: persisted state and the step function that
//! advances it.

use std::fmt;

use bitcoin::{
    secp256k1::{Secp256k1, SecretKey},
    Amount, Txid,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::*;
use tumbler_batching::BatchError;
use tumbler_escrow::{
    generate_escrow_key, verify_escape_signature, ClientEscapeData, EscrowCoordinator,
    EscrowError, EscrowRole, EscrowScriptParams, EscrowState, EscrowedCoin,
};
use tumbler_primitives::{
    ChannelId, CycleParameters, CyclePhase, Height, ParamsHash, ProtocolParameters,
};
use tumbler_wallet::{FundingError, Recipient, ReclaimError};

use crate::{
    chain::ChainError,
    progress::CycleProgressInfo,
    protocol::{OpenChannelRequest, ProtocolError, SignVoucherRequest},
    services::SessionServices,
};

/// Coarse position of a session, derived from [`SessionState`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    New,
    Registered,
    ClientChannelBroadcasted,
    TumblerVoucherObtained,
    TumblerChannelCreated,
    TumblerChannelSecured,
    PuzzleSolutionObtained,
    Completed,
    Wasted,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Wasted)
    }
}

/// How a completed session got its money back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CompletionKind {
    /// Cashed out the tumbler's escrow.
    Payment,
    /// Took back our own escrow with the tumbler's cooperation.
    Escape,
}

/// Session state. Each variant carries exactly what is needed to resume it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum SessionState {
    New,
    /// Holds the key of the escrow we are about to fund, so the refund path
    /// survives a crash between broadcast and save.
    Registered {
        channel_id: ChannelId,
        #[serde(with = "hex::serde")]
        unsigned_voucher: Vec<u8>,
        escrow_key: SecretKey,
    },
    ClientChannelBroadcasted {
        client_escrow: EscrowState,
        #[serde(with = "hex::serde")]
        unsigned_voucher: Vec<u8>,
    },
    /// Holds the receiver key handed to the tumbler before it funds its
    /// escrow.
    TumblerVoucherObtained {
        client_escrow: EscrowState,
        #[serde(with = "hex::serde")]
        signed_voucher: Vec<u8>,
        receiver_key: SecretKey,
    },
    TumblerChannelCreated {
        client_escrow: EscrowState,
        tumbler_escrow: EscrowState,
    },
    TumblerChannelSecured {
        client_escrow: EscrowState,
        tumbler_escrow: EscrowState,
    },
    PuzzleSolutionObtained {
        client_escrow: EscrowState,
        escape: ClientEscapeData,
    },
    Completed {
        kind: CompletionKind,
        txid: Txid,
    },
    Wasted {
        reason: String,
    },
}

impl SessionState {
    pub fn status(&self) -> PaymentStatus {
        match self {
            SessionState::New => PaymentStatus::New,
            SessionState::Registered { .. } => PaymentStatus::Registered,
            SessionState::ClientChannelBroadcasted { .. } => {
                PaymentStatus::ClientChannelBroadcasted
            }
            SessionState::TumblerVoucherObtained { .. } => PaymentStatus::TumblerVoucherObtained,
            SessionState::TumblerChannelCreated { .. } => PaymentStatus::TumblerChannelCreated,
            SessionState::TumblerChannelSecured { .. } => PaymentStatus::TumblerChannelSecured,
            SessionState::PuzzleSolutionObtained { .. } => PaymentStatus::PuzzleSolutionObtained,
            SessionState::Completed { .. } => PaymentStatus::Completed,
            SessionState::Wasted { .. } => PaymentStatus::Wasted,
        }
    }

    /// Our funded escrow, once there is one that is not yet spent.
    fn client_escrow(&self) -> Option<&EscrowState> {
        match self {
            SessionState::ClientChannelBroadcasted { client_escrow, .. }
            | SessionState::TumblerVoucherObtained { client_escrow, .. }
            | SessionState::TumblerChannelCreated { client_escrow, .. }
            | SessionState::TumblerChannelSecured { client_escrow, .. } => Some(client_escrow),
            _ => None,
        }
    }

    fn wasted(reason: impl fmt::Display) -> Self {
        SessionState::Wasted {
            reason: reason.to_string(),
        }
    }
}

/// What gets persisted for one cycle.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentSessionRecord {
    pub tumbler_parameters_hash: ParamsHash,
    pub start_cycle: Height,
    /// Phase observed by the last update, if the height was inside the cycle.
    pub phase: Option<CyclePhase>,
    pub state: SessionState,
}

/// Coarse classification the executor reacts to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    PrematureRequest,
    InvalidPhase,
    Other,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("funding: {0}")]
    Funding(#[from] BatchError<FundingError>),

    #[error("reclaim: {0}")]
    Reclaim(#[from] BatchError<ReclaimError>),

    #[error("funding transaction {0} does not pay the escrow")]
    FundingOutputMissing(Txid),
}

impl PaymentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PaymentError::Protocol(ProtocolError::PrematureRequest) => {
                FailureKind::PrematureRequest
            }
            PaymentError::Protocol(ProtocolError::InvalidPhase(_)) => FailureKind::InvalidPhase,
            _ => FailureKind::Other,
        }
    }
}

/// Drives one cycle of the protocol, one step per call to [`Self::update`].
#[derive(Debug)]
pub struct PaymentStateMachine {
    cycle: CycleParameters,
    record: PaymentSessionRecord,
    need_save: bool,
}

impl PaymentStateMachine {
    /// Fresh session for `cycle`, not yet persisted.
    pub fn new(params: &ProtocolParameters, cycle: CycleParameters) -> Self {
        Self {
            cycle,
            record: PaymentSessionRecord {
                tumbler_parameters_hash: params.hash(),
                start_cycle: cycle.start,
                phase: None,
                state: SessionState::New,
            },
            need_save: true,
        }
    }

    /// Resumes a persisted session. Returns `None` for records made under
    /// other parameters, or for a start the generator never produces.
    pub fn resume(params: &ProtocolParameters, record: PaymentSessionRecord) -> Option<Self> {
        if record.tumbler_parameters_hash != params.hash() {
            return None;
        }
        let cycle = params.cycle_generator.cycle_at(record.start_cycle)?;
        Some(Self {
            cycle,
            record,
            need_save: false,
        })
    }

    pub fn cycle(&self) -> &CycleParameters {
        &self.cycle
    }

    pub fn record(&self) -> &PaymentSessionRecord {
        &self.record
    }

    pub fn state(&self) -> &SessionState {
        &self.record.state
    }

    pub fn status(&self) -> PaymentStatus {
        self.record.state.status()
    }

    pub fn need_save(&self) -> bool {
        self.need_save
    }

    pub fn mark_saved(&mut self) {
        self.need_save = false;
    }

    pub fn progress(&self, height: Height) -> CycleProgressInfo {
        CycleProgressInfo::new(&self.cycle, height, self.status())
    }

    /// Performs at most one protocol step for the phase at `height`.
    ///
    /// Returns `None` when `height` lies outside the cycle.
    pub async fn update(
        &mut self,
        height: Height,
        services: &SessionServices,
    ) -> Result<Option<CycleProgressInfo>, PaymentError> {
        let Some(phase) = self.cycle.phase_at(height) else {
            return Ok(None);
        };
        if self.record.phase != Some(phase) {
            self.record.phase = Some(phase);
            self.need_save = true;
        }

        let next = match self.step(phase, services).await {
            Ok(next) => next,
            Err(PaymentError::Protocol(ProtocolError::Rejected(reason))) => {
                Some(SessionState::wasted(format!("rejected by tumbler: {reason}")))
            }
            Err(e) => return Err(e),
        };

        if let Some(next) = next {
            let from = self.status();
            if let SessionState::Wasted { reason } = &next {
                warn!(cycle = self.cycle.start, %phase, %reason, "session wasted");
            }
            info!(cycle = self.cycle.start, %phase, ?from, to = ?next.status(), "session advanced");
            self.record.state = next;
            self.need_save = true;
        }

        Ok(Some(self.progress(height)))
    }

    async fn step(
        &self,
        phase: CyclePhase,
        services: &SessionServices,
    ) -> Result<Option<SessionState>, PaymentError> {
        use CyclePhase::*;

        let start = self.cycle.start;
        let tumbler = &services.tumbler;

        match (phase, &self.record.state) {
            (Registration, SessionState::New) => {
                let reg = tumbler.register(start).await?;
                Ok(Some(SessionState::Registered {
                    channel_id: reg.channel_id,
                    unsigned_voucher: reg.unsigned_voucher,
                    escrow_key: generate_escrow_key(),
                }))
            }

            (
                ClientChannelEstablishment,
                SessionState::Registered {
                    channel_id,
                    unsigned_voucher,
                    escrow_key,
                },
            ) => {
                let client_escrow = self
                    .fund_client_escrow(*channel_id, *escrow_key, services)
                    .await?;
                Ok(Some(SessionState::ClientChannelBroadcasted {
                    client_escrow,
                    unsigned_voucher: unsigned_voucher.clone(),
                }))
            }

            (
                ClientChannelEstablishment | TumblerChannelEstablishment,
                SessionState::ClientChannelBroadcasted {
                    client_escrow,
                    unsigned_voucher,
                },
            ) => {
                let needed = services.confirmations.client_escrow;
                if !confirmed(services, &client_escrow.coin, needed).await? {
                    return Ok(None);
                }
                let secp = Secp256k1::signing_only();
                let signed_voucher = tumbler
                    .sign_voucher(SignVoucherRequest {
                        cycle_start: start,
                        channel_id: client_escrow.channel_id,
                        unsigned_voucher: unsigned_voucher.clone(),
                        client_escrow: client_escrow.coin.clone(),
                        client_escrow_key: client_escrow.public_key(&secp),
                    })
                    .await?;
                Ok(Some(SessionState::TumblerVoucherObtained {
                    client_escrow: client_escrow.clone(),
                    signed_voucher,
                    receiver_key: generate_escrow_key(),
                }))
            }

            (
                TumblerChannelEstablishment,
                SessionState::TumblerVoucherObtained {
                    client_escrow,
                    signed_voucher,
                    receiver_key,
                },
            ) => {
                self.open_tumbler_channel(client_escrow, signed_voucher, *receiver_key, services)
                    .await
            }

            (
                TumblerChannelEstablishment | PaymentPhase,
                SessionState::TumblerChannelCreated {
                    client_escrow,
                    tumbler_escrow,
                },
            ) => {
                let needed = services.confirmations.tumbler_escrow;
                if !confirmed(services, &tumbler_escrow.coin, needed).await? {
                    return Ok(None);
                }
                Ok(Some(SessionState::TumblerChannelSecured {
                    client_escrow: client_escrow.clone(),
                    tumbler_escrow: tumbler_escrow.clone(),
                }))
            }

            (
                PaymentPhase,
                SessionState::TumblerChannelSecured {
                    client_escrow,
                    tumbler_escrow,
                },
            ) => {
                let coordinator =
                    EscrowCoordinator::with_state(EscrowRole::Receiver, tumbler_escrow.clone())?;
                let sig = tumbler
                    .exchange_payment(start, tumbler_escrow.channel_id)
                    .await?;
                let escape = match checked_escape(&coordinator, sig) {
                    Ok(escape) => escape,
                    Err(EscrowError::BadSignature | EscrowError::SignatureEncoding(_)) => {
                        return Ok(Some(SessionState::wasted(
                            "tumbler sent an invalid payment signature",
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                Ok(Some(SessionState::PuzzleSolutionObtained {
                    client_escrow: client_escrow.clone(),
                    escape,
                }))
            }

            (
                TumblerCashoutPhase | ClientCashoutPhase,
                SessionState::PuzzleSolutionObtained { escape, .. },
            ) => {
                let tx = services.reclaimer.reclaim(escape.clone()).await?;
                Ok(Some(SessionState::Completed {
                    kind: CompletionKind::Payment,
                    txid: tx.compute_txid(),
                }))
            }

            (TumblerCashoutPhase | ClientCashoutPhase, state) => {
                let Some(client_escrow) = state.client_escrow() else {
                    return Ok(None);
                };
                self.escape_client_escrow(client_escrow, services).await
            }

            _ => Ok(None),
        }
    }

    async fn fund_client_escrow(
        &self,
        channel_id: ChannelId,
        key: SecretKey,
        services: &SessionServices,
    ) -> Result<EscrowState, PaymentError> {
        let secp = Secp256k1::signing_only();
        let tumbler_key = services
            .tumbler
            .request_tumbler_escrow_key(self.cycle.start, channel_id)
            .await?;

        let script = EscrowScriptParams::new(
            key.public_key(&secp),
            tumbler_key,
            self.cycle.client_lock_time(),
        )?;
        let amount = services.params.funding_amount();
        let recipient = Recipient {
            script_pubkey: script.script_pubkey(),
            amount,
        };

        let tx = services.funder.fund(recipient.clone()).await?;
        let outpoint = recipient
            .locate(&tx)
            .ok_or_else(|| PaymentError::FundingOutputMissing(tx.compute_txid()))?;
        debug!(cycle = self.cycle.start, %outpoint, "client escrow funded");

        Ok(EscrowState {
            coin: EscrowedCoin::new(outpoint, amount, &script),
            key,
            channel_id,
        })
    }

    async fn open_tumbler_channel(
        &self,
        client_escrow: &EscrowState,
        signed_voucher: &[u8],
        key: SecretKey,
        services: &SessionServices,
    ) -> Result<Option<SessionState>, PaymentError> {
        let secp = Secp256k1::signing_only();
        let offer = services
            .tumbler
            .open_tumbler_channel(OpenChannelRequest {
                cycle_start: self.cycle.start,
                signed_voucher: signed_voucher.to_vec(),
                receiver_key: key.public_key(&secp),
            })
            .await?;

        if let Err(reason) = self.check_tumbler_escrow(&offer.escrow, services.params.denomination)
        {
            return Ok(Some(SessionState::wasted(reason)));
        }

        let tumbler_escrow = EscrowState {
            coin: offer.escrow,
            key,
            channel_id: offer.channel_id,
        };
        // rejects a script that does not name our key as receiver
        match EscrowCoordinator::with_state(EscrowRole::Receiver, tumbler_escrow.clone()) {
            Ok(_) => {}
            Err(EscrowError::KeyMismatch(_)) => {
                return Ok(Some(SessionState::wasted(
                    "tumbler escrow does not pay our key",
                )));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(SessionState::TumblerChannelCreated {
            client_escrow: client_escrow.clone(),
            tumbler_escrow,
        }))
    }

    /// Checks lock time and amount of the escrow the tumbler offers us.
    fn check_tumbler_escrow(&self, coin: &EscrowedCoin, expected: Amount) -> Result<(), String> {
        let params = coin
            .params()
            .map_err(|e| format!("unexpected tumbler escrow script: {e}"))?;
        let lock_time = params.lock_time.to_consensus_u32();
        if lock_time != self.cycle.tumbler_lock_time() {
            return Err(format!(
                "tumbler escrow lock time {lock_time}, expected {}",
                self.cycle.tumbler_lock_time()
            ));
        }
        if coin.amount != expected {
            return Err(format!(
                "tumbler escrow holds {}, expected {expected}",
                coin.amount
            ));
        }
        Ok(())
    }

    async fn escape_client_escrow(
        &self,
        client_escrow: &EscrowState,
        services: &SessionServices,
    ) -> Result<Option<SessionState>, PaymentError> {
        let coordinator =
            EscrowCoordinator::with_state(EscrowRole::Initiator, client_escrow.clone())?;
        let sig = services
            .tumbler
            .request_escape(
                self.cycle.start,
                client_escrow.channel_id,
                client_escrow.coin.outpoint,
            )
            .await?;
        let escape = match checked_escape(&coordinator, sig) {
            Ok(escape) => escape,
            Err(EscrowError::BadSignature | EscrowError::SignatureEncoding(_)) => {
                return Ok(Some(SessionState::wasted(
                    "tumbler sent an invalid escape signature",
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let tx = services.reclaimer.reclaim(escape).await?;
        Ok(Some(SessionState::Completed {
            kind: CompletionKind::Escape,
            txid: tx.compute_txid(),
        }))
    }
}

async fn confirmed(
    services: &SessionServices,
    coin: &EscrowedCoin,
    needed: u32,
) -> Result<bool, PaymentError> {
    let txid = coin.outpoint.txid;
    let confs = services.explorer.confirmations(txid).await?.unwrap_or(0);
    if confs < needed {
        debug!(%txid, %confs, %needed, "waiting for escrow confirmations");
        return Ok(false);
    }
    Ok(true)
}

/// Verifies the counterparty's escape signature and bundles it with our key.
fn checked_escape(
    coordinator: &EscrowCoordinator,
    signature: Vec<u8>,
) -> Result<ClientEscapeData, EscrowError> {
    let coin = coordinator.coin().ok_or(EscrowError::NotConfigured)?;
    let signer = coordinator
        .counterparty_key()
        .ok_or(EscrowError::NotConfigured)?;
    verify_escape_signature(&Secp256k1::verification_only(), coin, &signer, &signature)?;
    coordinator.escape_data(signature)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::{
        absolute::LockTime, hashes::Hash, secp256k1::SecretKey, transaction::Version, OutPoint,
        ScriptBuf, Transaction, TxOut,
    };
    use mockall::predicate::*;
    use tumbler_escrow::sign_escape;

    use super::*;
    use crate::{
        chain::MockBlockExplorer,
        protocol::{MockTumblerProtocolClient, Registration, TumblerEscrowOffer},
        services::{ConfirmationTargets, MockEscrowFunder, MockEscrowReclaimer},
        test_utils::sample_params,
    };

    struct Mocks {
        tumbler: MockTumblerProtocolClient,
        explorer: MockBlockExplorer,
        funder: MockEscrowFunder,
        reclaimer: MockEscrowReclaimer,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                tumbler: MockTumblerProtocolClient::new(),
                explorer: MockBlockExplorer::new(),
                funder: MockEscrowFunder::new(),
                reclaimer: MockEscrowReclaimer::new(),
            }
        }

        fn into_services(self, params: &ProtocolParameters) -> SessionServices {
            SessionServices {
                params: Arc::new(params.clone()),
                tumbler: Arc::new(self.tumbler),
                explorer: Arc::new(self.explorer),
                funder: Arc::new(self.funder),
                reclaimer: Arc::new(self.reclaimer),
                confirmations: ConfirmationTargets {
                    client_escrow: 2,
                    tumbler_escrow: 1,
                },
            }
        }
    }

    fn machine(params: &ProtocolParameters, state: SessionState) -> PaymentStateMachine {
        let cycle = params.cycle_generator.first_cycle().with_start(100);
        let mut m = PaymentStateMachine::new(params, cycle);
        m.record.state = state;
        m.mark_saved();
        m
    }

    fn phase_start(m: &PaymentStateMachine, phase: CyclePhase) -> Height {
        m.cycle().periods().get(phase).start
    }

    fn escrow_state(initiator: &SecretKey, receiver: &SecretKey, lock: Height) -> EscrowState {
        let secp = Secp256k1::new();
        let params = EscrowScriptParams::new(
            initiator.public_key(&secp),
            receiver.public_key(&secp),
            lock,
        )
        .unwrap();
        EscrowState {
            coin: EscrowedCoin::new(
                OutPoint::new(Txid::all_zeros(), 3),
                Amount::from_sat(100_000),
                &params,
            ),
            key: *initiator,
            channel_id: ChannelId::new([7; 20]),
        }
    }

    fn dummy_tx(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: outputs,
        }
    }

    #[tokio::test]
    async fn test_registration_moves_new_to_registered() {
        let params = sample_params();
        let mut mocks = Mocks::new();
        mocks.tumbler.expect_register().with(eq(100)).times(1).returning(|_| {
            Ok(Registration {
                channel_id: ChannelId::new([1; 20]),
                unsigned_voucher: vec![9, 9],
            })
        });
        let services = mocks.into_services(&params);

        let mut m = machine(&params, SessionState::New);
        let info = m.update(100, &services).await.unwrap().unwrap();

        assert_eq!(info.status, PaymentStatus::Registered);
        assert!(m.need_save());
        assert_eq!(m.record().phase, Some(CyclePhase::Registration));

        let json = serde_json::to_value(m.record()).unwrap();
        assert!(json["state"]["escrow_key"].is_string());
    }

    #[tokio::test]
    async fn test_outside_cycle_is_noop() {
        let params = sample_params();
        let services = Mocks::new().into_services(&params);
        let mut m = machine(&params, SessionState::New);

        assert_eq!(m.update(99, &services).await.unwrap(), None);
        assert!(!m.need_save());
    }

    #[tokio::test]
    async fn test_wrong_phase_for_state_is_noop() {
        let params = sample_params();
        // no expectations: any tumbler call would panic
        let services = Mocks::new().into_services(&params);
        let mut m = machine(&params, SessionState::New);

        let height = phase_start(&m, CyclePhase::PaymentPhase);
        let info = m.update(height, &services).await.unwrap().unwrap();
        assert_eq!(info.status, PaymentStatus::New);
        assert_eq!(m.state(), &SessionState::New);
    }

    #[tokio::test]
    async fn test_rejection_wastes_session() {
        let params = sample_params();
        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_register()
            .returning(|_| Err(ProtocolError::Rejected("cycle full".into())));
        let services = mocks.into_services(&params);

        let mut m = machine(&params, SessionState::New);
        m.update(100, &services).await.unwrap();

        assert_eq!(m.status(), PaymentStatus::Wasted);
        assert!(m.need_save());
    }

    #[tokio::test]
    async fn test_invalid_phase_surfaces_as_kind() {
        let params = sample_params();
        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_register()
            .returning(|_| Err(ProtocolError::InvalidPhase("client-channel".into())));
        let services = mocks.into_services(&params);

        let mut m = machine(&params, SessionState::New);
        let err = m.update(100, &services).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidPhase);
        assert_eq!(m.status(), PaymentStatus::New);

        let premature = PaymentError::from(ProtocolError::PrematureRequest);
        assert_eq!(premature.kind(), FailureKind::PrematureRequest);
        assert!(premature.to_string().contains("transport circuit"));
        let transport = PaymentError::from(ProtocolError::Transport("invalid phase".into()));
        assert_eq!(transport.kind(), FailureKind::Other);
    }

    #[tokio::test]
    async fn test_funding_builds_client_escrow() {
        let params = sample_params();
        let secp = Secp256k1::new();
        let tumbler_key = generate_escrow_key().public_key(&secp);
        let escrow_key = generate_escrow_key();
        let funding_amount = params.funding_amount();

        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_request_tumbler_escrow_key()
            .returning(move |_, _| Ok(tumbler_key));
        mocks.funder.expect_fund().times(1).returning(move |r| {
            assert_eq!(r.amount, funding_amount);
            let change = TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::new(),
            };
            Ok(dummy_tx(vec![change, r.txout()]))
        });
        let services = mocks.into_services(&params);

        let mut m = machine(
            &params,
            SessionState::Registered {
                channel_id: ChannelId::new([1; 20]),
                unsigned_voucher: vec![1],
                escrow_key,
            },
        );
        let height = phase_start(&m, CyclePhase::ClientChannelEstablishment);
        m.update(height, &services).await.unwrap();

        let SessionState::ClientChannelBroadcasted { client_escrow, .. } = m.state() else {
            panic!("unexpected state {:?}", m.state());
        };
        assert_eq!(client_escrow.coin.outpoint.vout, 1);
        assert_eq!(client_escrow.coin.amount, funding_amount);
        assert_eq!(client_escrow.key, escrow_key);
        let script = client_escrow.coin.params().unwrap();
        assert_eq!(script.initiator, escrow_key.public_key(&secp));
        assert_eq!(script.receiver, tumbler_key);
        assert_eq!(
            script.lock_time.to_consensus_u32(),
            m.cycle().client_lock_time()
        );
    }

    #[tokio::test]
    async fn test_failed_funding_keeps_escrow_key() {
        let params = sample_params();
        let secp = Secp256k1::new();
        let tumbler_key = generate_escrow_key().public_key(&secp);
        let state = SessionState::Registered {
            channel_id: ChannelId::new([1; 20]),
            unsigned_voucher: vec![1],
            escrow_key: generate_escrow_key(),
        };

        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_request_tumbler_escrow_key()
            .returning(move |_, _| Ok(tumbler_key));
        // broadcast went out but does not pay the escrow
        mocks
            .funder
            .expect_fund()
            .times(1)
            .returning(|_| Ok(dummy_tx(Vec::new())));
        let services = mocks.into_services(&params);

        let mut m = machine(&params, state.clone());
        let height = phase_start(&m, CyclePhase::ClientChannelEstablishment);
        let err = m.update(height, &services).await.unwrap_err();

        assert!(matches!(err, PaymentError::FundingOutputMissing(_)));
        assert_eq!(m.state(), &state);
    }

    #[tokio::test]
    async fn test_voucher_step_creates_receiver_key_used_for_tumbler_channel() {
        let params = sample_params();
        let ours = generate_escrow_key();
        let theirs = generate_escrow_key();
        let client_escrow = escrow_state(&ours, &theirs, 500);

        let mut mocks = Mocks::new();
        mocks.explorer.expect_confirmations().returning(|_| Ok(Some(6)));
        mocks
            .tumbler
            .expect_sign_voucher()
            .times(1)
            .returning(|_| Ok(vec![3]));
        let services = mocks.into_services(&params);

        let mut m = machine(
            &params,
            SessionState::ClientChannelBroadcasted {
                client_escrow,
                unsigned_voucher: vec![1],
            },
        );
        let height = phase_start(&m, CyclePhase::ClientChannelEstablishment);
        m.update(height, &services).await.unwrap();

        let SessionState::TumblerVoucherObtained { receiver_key, .. } = m.state() else {
            panic!("unexpected state {:?}", m.state());
        };
        let expected = receiver_key.public_key(&Secp256k1::new());

        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_open_tumbler_channel()
            .withf(move |req| req.receiver_key == expected)
            .times(1)
            .returning(|_| Err(ProtocolError::Transport("offline".into())));
        let services = mocks.into_services(&params);

        let height = phase_start(&m, CyclePhase::TumblerChannelEstablishment);
        m.update(height, &services).await.unwrap_err();
        assert_eq!(m.status(), PaymentStatus::TumblerVoucherObtained);
    }

    #[tokio::test]
    async fn test_waits_for_client_escrow_confirmations() {
        let params = sample_params();
        let ours = generate_escrow_key();
        let theirs = generate_escrow_key();
        let state = SessionState::ClientChannelBroadcasted {
            client_escrow: escrow_state(&ours, &theirs, 500),
            unsigned_voucher: vec![1],
        };

        let mut mocks = Mocks::new();
        mocks.explorer.expect_confirmations().returning(|_| Ok(Some(1)));
        mocks.tumbler.expect_sign_voucher().never();
        let services = mocks.into_services(&params);

        let mut m = machine(&params, state.clone());
        let height = phase_start(&m, CyclePhase::ClientChannelEstablishment);
        m.update(height, &services).await.unwrap();
        assert_eq!(m.state(), &state);
    }

    #[tokio::test]
    async fn test_bad_payment_signature_wastes_session() {
        let params = sample_params();
        let client_key = generate_escrow_key();
        let tumbler_key = generate_escrow_key();
        let receiver_key = generate_escrow_key();
        let mut tumbler_escrow = escrow_state(&tumbler_key, &receiver_key, 700);
        tumbler_escrow.key = receiver_key;

        let secp = Secp256k1::new();
        // signed by the wrong key
        let bogus = sign_escape(&secp, &tumbler_escrow.coin, &receiver_key)
            .unwrap()
            .to_vec();

        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_exchange_payment()
            .returning(move |_, _| Ok(bogus.clone()));
        let services = mocks.into_services(&params);

        let mut m = machine(
            &params,
            SessionState::TumblerChannelSecured {
                client_escrow: escrow_state(&client_key, &tumbler_key, 800),
                tumbler_escrow,
            },
        );
        let height = phase_start(&m, CyclePhase::PaymentPhase);
        m.update(height, &services).await.unwrap();
        assert_eq!(m.status(), PaymentStatus::Wasted);
    }

    #[tokio::test]
    async fn test_cashout_escapes_unpaid_client_escrow() {
        let params = sample_params();
        let secp = Secp256k1::new();
        let client_key = generate_escrow_key();
        let tumbler_key = generate_escrow_key();
        let client_escrow = escrow_state(&client_key, &tumbler_key, 800);
        let sig = sign_escape(&secp, &client_escrow.coin, &tumbler_key)
            .unwrap()
            .to_vec();
        let outpoint = client_escrow.coin.outpoint;

        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_request_escape()
            .withf(move |_, _, op| *op == outpoint)
            .times(1)
            .returning(move |_, _, _| Ok(sig.clone()));
        mocks.reclaimer.expect_reclaim().times(1).returning(move |e| {
            assert_eq!(e.escrow_key, client_key);
            Ok(dummy_tx(Vec::new()))
        });
        let services = mocks.into_services(&params);

        let mut m = machine(
            &params,
            SessionState::TumblerVoucherObtained {
                client_escrow,
                signed_voucher: vec![2],
                receiver_key: generate_escrow_key(),
            },
        );
        let height = phase_start(&m, CyclePhase::TumblerCashoutPhase);
        m.update(height, &services).await.unwrap();

        assert!(matches!(
            m.state(),
            SessionState::Completed {
                kind: CompletionKind::Escape,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_foreign_params() {
        let params = sample_params();
        let m = machine(&params, SessionState::New);
        let record = m.record().clone();

        assert!(PaymentStateMachine::resume(&params, record.clone()).is_some());

        let mut other = params.clone();
        other.fee = Amount::from_sat(1);
        assert!(PaymentStateMachine::resume(&other, record).is_none());
    }

    #[test]
    fn test_record_json_is_tagged() {
        let record = PaymentSessionRecord {
            tumbler_parameters_hash: ParamsHash::new([0; 32]),
            start_cycle: 100,
            phase: Some(CyclePhase::Registration),
            state: SessionState::Registered {
                channel_id: ChannelId::new([1; 20]),
                unsigned_voucher: vec![0xab],
                escrow_key: SecretKey::from_slice(&[3; 32]).unwrap(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"]["status"], "Registered");
        assert_eq!(json["state"]["unsigned_voucher"], "ab");

        let back: PaymentSessionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_offer_with_wrong_lock_time_wastes_session() {
        let params = sample_params();
        let client_key = generate_escrow_key();
        let tumbler_key = generate_escrow_key();
        let client_escrow = escrow_state(&client_key, &tumbler_key, 800);

        let mut mocks = Mocks::new();
        mocks
            .tumbler
            .expect_open_tumbler_channel()
            .returning(move |req| {
                let secp = Secp256k1::new();
                let script = EscrowScriptParams::new(
                    tumbler_key.public_key(&secp),
                    req.receiver_key,
                    1,
                )
                .unwrap();
                Ok(TumblerEscrowOffer {
                    channel_id: ChannelId::new([4; 20]),
                    escrow: EscrowedCoin::new(
                        OutPoint::new(Txid::all_zeros(), 9),
                        Amount::from_sat(100_000_000),
                        &script,
                    ),
                })
            });
        let services = mocks.into_services(&params);

        let mut m = machine(
            &params,
            SessionState::TumblerVoucherObtained {
                client_escrow,
                signed_voucher: vec![2],
                receiver_key: generate_escrow_key(),
            },
        );
        let height = phase_start(&m, CyclePhase::TumblerChannelEstablishment);
        m.update(height, &services).await.unwrap();
        assert_eq!(m.status(), PaymentStatus::Wasted);
    }
}
