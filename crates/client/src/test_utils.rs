//! In-process fakes of the client's collaborators, for tests and local runs.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    secp256k1::{All, PublicKey, Secp256k1, SecretKey},
    Amount, BlockHash, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tumbler_escrow::{generate_escrow_key, sign_escape, EscrowScriptParams, EscrowedCoin};
use tumbler_primitives::{
    ChannelId, CycleParameters, Height, OverlappedCycleGenerator, ProtocolParameters,
};
use tumbler_wallet::{Broadcaster, SpendableCoin, WalletClient, WalletError};

use crate::{
    chain::{BlockExplorer, BlockRef, ChainError, ChainOracle},
    progress::{ProgressError, ProgressInfo, ProgressSink},
    protocol::{
        OpenChannelRequest, ProtocolError, Registration, SignVoucherRequest,
        TumblerEscrowOffer, TumblerProtocolClient,
    },
};

/// Regtest parameters with a first cycle at height 100: ten blocks of
/// registration followed by two blocks per remaining phase.
pub fn sample_params() -> ProtocolParameters {
    let first_cycle = CycleParameters {
        start: 100,
        registration_duration: 10,
        client_channel_establishment_duration: 2,
        tumbler_channel_establishment_duration: 2,
        payment_phase_duration: 2,
        tumbler_cashout_duration: 2,
        client_cashout_duration: 2,
        safety_period_duration: 1,
    };
    let secp = Secp256k1::signing_only();
    let server_key = SecretKey::from_slice(&[0x11; 32])
        .map(|k| k.public_key(&secp))
        .unwrap_or_else(|_| generate_escrow_key().public_key(&secp));

    ProtocolParameters {
        version: 2,
        network: Network::Regtest,
        denomination: Amount::from_sat(100_000_000),
        fee: Amount::from_sat(10_000),
        real_puzzle_count: 15,
        fake_puzzle_count: 285,
        real_transaction_count: 42,
        fake_transaction_count: 42,
        cycle_generator: OverlappedCycleGenerator::new(first_cycle, 0)
            .unwrap_or_else(|e| panic!("sample cycle is valid: {e}")),
        server_key,
    }
}

/// Block at `height` with a hash unique to that height.
pub fn block_ref(height: Height) -> BlockRef {
    let mut bytes = [0xb1; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    BlockRef {
        height,
        hash: BlockHash::from_byte_array(bytes),
    }
}

/// Chain whose tip is moved by hand.
#[derive(Debug)]
pub struct FakeChain {
    tip: watch::Sender<BlockRef>,
}

impl FakeChain {
    pub fn new(height: Height) -> Self {
        Self {
            tip: watch::channel(block_ref(height)).0,
        }
    }

    pub fn set_height(&self, height: Height) {
        self.tip.send_replace(block_ref(height));
    }
}

#[async_trait]
impl ChainOracle for FakeChain {
    async fn current_height(&self) -> Result<Height, ChainError> {
        Ok(self.tip.borrow().height)
    }

    async fn wait_for_block_after(
        &self,
        last_seen: Option<BlockHash>,
    ) -> Result<BlockRef, ChainError> {
        let mut rx = self.tip.subscribe();
        let tip = rx
            .wait_for(|b| Some(b.hash) != last_seen)
            .await
            .map_err(|e| ChainError::backend(e.to_string()))?;
        Ok(*tip)
    }
}

/// Reports the same depth for every transaction.
#[derive(Debug)]
pub struct FakeExplorer {
    pub confirmations: u32,
}

#[async_trait]
impl BlockExplorer for FakeExplorer {
    async fn confirmations(&self, _txid: Txid) -> Result<Option<u32>, ChainError> {
        Ok(Some(self.confirmations))
    }
}

fn tagged_script(tag: &[u8]) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&ScriptBuf::from_bytes(tag.to_vec()).wscript_hash())
}

/// Wallet with a settable balance. Signing returns the transaction unchanged.
#[derive(Debug)]
pub struct FakeWallet {
    balance: Mutex<Amount>,
    coins: Mutex<Vec<SpendableCoin>>,
    destinations: AtomicU32,
}

impl FakeWallet {
    pub fn new(balance: Amount) -> Self {
        let coin = SpendableCoin {
            outpoint: OutPoint::new(Txid::from_byte_array([0xc0; 32]), 0),
            txout: TxOut {
                value: balance,
                script_pubkey: tagged_script(b"wallet"),
            },
            confirmations: 6,
        };
        Self {
            balance: Mutex::new(balance),
            coins: Mutex::new(vec![coin]),
            destinations: AtomicU32::new(0),
        }
    }

    /// Changes the reported balance without touching the coin list.
    pub fn set_balance(&self, balance: Amount) {
        *self.balance.lock() = balance;
    }
}

#[async_trait]
impl WalletClient for FakeWallet {
    async fn spendable_balance(&self, _min_confirmations: u32) -> Result<Amount, WalletError> {
        Ok(*self.balance.lock())
    }

    async fn list_spendable(
        &self,
        min_confirmations: u32,
    ) -> Result<Vec<SpendableCoin>, WalletError> {
        Ok(self
            .coins
            .lock()
            .iter()
            .filter(|c| c.confirmations >= min_confirmations)
            .cloned()
            .collect())
    }

    async fn change_script(&self) -> Result<ScriptBuf, WalletError> {
        Ok(tagged_script(b"change"))
    }

    async fn new_destination(&self) -> Result<ScriptBuf, WalletError> {
        let n = self.destinations.fetch_add(1, Ordering::SeqCst);
        Ok(tagged_script(&n.to_le_bytes()))
    }

    async fn sign_transaction(
        &self,
        tx: Transaction,
        _spent: Vec<TxOut>,
    ) -> Result<Transaction, WalletError> {
        Ok(tx)
    }
}

/// Keeps every broadcast transaction.
#[derive(Debug, Default)]
pub struct FakeBroadcaster {
    txs: Mutex<Vec<Transaction>>,
}

impl FakeBroadcaster {
    pub fn transactions(&self) -> Vec<Transaction> {
        self.txs.lock().clone()
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, WalletError> {
        self.txs.lock().push(tx.clone());
        Ok(tx.compute_txid())
    }
}

/// Keeps the latest snapshot and lets tests wait for a height.
#[derive(Debug)]
pub struct MemoryProgressSink {
    latest: watch::Sender<Option<ProgressInfo>>,
}

impl Default for MemoryProgressSink {
    fn default() -> Self {
        Self {
            latest: watch::channel(None).0,
        }
    }
}

impl MemoryProgressSink {
    pub fn latest(&self) -> Option<ProgressInfo> {
        self.latest.borrow().clone()
    }

    /// Resolves with the first snapshot at or above `height`.
    pub async fn wait_for_height(&self, height: Height) -> ProgressInfo {
        let mut rx = self.latest.subscribe();
        let info = rx
            .wait_for(|i| i.as_ref().is_some_and(|i| i.height >= height))
            .await
            .map(|i| i.clone())
            .ok()
            .flatten();
        info.unwrap_or_default()
    }
}

impl ProgressSink for MemoryProgressSink {
    fn publish(&self, info: &ProgressInfo) -> Result<(), ProgressError> {
        self.latest.send_replace(Some(info.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TumblerBook {
    next_channel: u8,
    /// Our key as receiver of each client escrow, and the escrow once known.
    client_channels: HashMap<ChannelId, (SecretKey, Option<EscrowedCoin>)>,
    /// Our key as initiator of each escrow we funded.
    tumbler_channels: HashMap<ChannelId, (SecretKey, EscrowedCoin)>,
}

/// Honest tumbler that follows the protocol without checking phases.
#[derive(Debug)]
pub struct FakeTumbler {
    params: ProtocolParameters,
    secp: Secp256k1<All>,
    book: Mutex<TumblerBook>,
}

impl FakeTumbler {
    pub fn new(params: ProtocolParameters) -> Self {
        Self {
            params,
            secp: Secp256k1::new(),
            book: Mutex::new(TumblerBook::default()),
        }
    }

    /// Escrows funded towards clients so far.
    pub fn funded_escrows(&self) -> Vec<EscrowedCoin> {
        self.book
            .lock()
            .tumbler_channels
            .values()
            .map(|(_, coin)| coin.clone())
            .collect()
    }

    fn next_channel(book: &mut TumblerBook) -> u8 {
        book.next_channel = book.next_channel.wrapping_add(1);
        book.next_channel
    }
}

#[async_trait]
impl TumblerProtocolClient for FakeTumbler {
    async fn register(&self, cycle_start: Height) -> Result<Registration, ProtocolError> {
        let mut book = self.book.lock();
        let n = Self::next_channel(&mut book);
        let channel_id = ChannelId::new([n; 20]);
        book.client_channels
            .insert(channel_id, (generate_escrow_key(), None));
        Ok(Registration {
            channel_id,
            unsigned_voucher: cycle_start.to_be_bytes().to_vec(),
        })
    }

    async fn request_tumbler_escrow_key(
        &self,
        _cycle_start: Height,
        channel_id: ChannelId,
    ) -> Result<PublicKey, ProtocolError> {
        let book = self.book.lock();
        let (key, _) = book
            .client_channels
            .get(&channel_id)
            .ok_or_else(|| ProtocolError::Rejected("unknown channel".into()))?;
        Ok(key.public_key(&self.secp))
    }

    async fn sign_voucher(&self, request: SignVoucherRequest) -> Result<Vec<u8>, ProtocolError> {
        let mut book = self.book.lock();
        let (key, coin) = book
            .client_channels
            .get_mut(&request.channel_id)
            .ok_or_else(|| ProtocolError::Rejected("unknown channel".into()))?;

        let script = request
            .client_escrow
            .params()
            .map_err(|e| ProtocolError::Rejected(e.to_string()))?;
        if script.receiver != key.public_key(&self.secp)
            || script.initiator != request.client_escrow_key
        {
            return Err(ProtocolError::Rejected("escrow keys do not match".into()));
        }
        *coin = Some(request.client_escrow);

        let mut voucher = request.unsigned_voucher;
        voucher.reverse();
        Ok(voucher)
    }

    async fn open_tumbler_channel(
        &self,
        request: OpenChannelRequest,
    ) -> Result<TumblerEscrowOffer, ProtocolError> {
        let cycle = self
            .params
            .cycle_generator
            .cycle_at(request.cycle_start)
            .ok_or_else(|| ProtocolError::Rejected("unknown cycle".into()))?;

        let key = generate_escrow_key();
        let script = EscrowScriptParams::new(
            key.public_key(&self.secp),
            request.receiver_key,
            cycle.tumbler_lock_time(),
        )
        .map_err(|e| ProtocolError::Other(e.to_string()))?;

        let mut book = self.book.lock();
        let n = Self::next_channel(&mut book);
        let channel_id = ChannelId::new([n; 20]);
        let coin = EscrowedCoin::new(
            OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            self.params.denomination,
            &script,
        );
        book.tumbler_channels
            .insert(channel_id, (key, coin.clone()));

        Ok(TumblerEscrowOffer {
            channel_id,
            escrow: coin,
        })
    }

    async fn exchange_payment(
        &self,
        _cycle_start: Height,
        channel_id: ChannelId,
    ) -> Result<Vec<u8>, ProtocolError> {
        let book = self.book.lock();
        let (key, coin) = book
            .tumbler_channels
            .get(&channel_id)
            .ok_or_else(|| ProtocolError::Rejected("unknown channel".into()))?;
        let sig = sign_escape(&self.secp, coin, key)
            .map_err(|e| ProtocolError::Other(e.to_string()))?;
        Ok(sig.to_vec())
    }

    async fn request_escape(
        &self,
        _cycle_start: Height,
        channel_id: ChannelId,
        escrow: OutPoint,
    ) -> Result<Vec<u8>, ProtocolError> {
        let book = self.book.lock();
        let Some((key, Some(coin))) = book.client_channels.get(&channel_id) else {
            return Err(ProtocolError::Rejected("no escrow for channel".into()));
        };
        if coin.outpoint != escrow {
            return Err(ProtocolError::Rejected("escrow outpoint mismatch".into()));
        }
        let sig = sign_escape(&self.secp, coin, key)
            .map_err(|e| ProtocolError::Other(e.to_string()))?;
        Ok(sig.to_vec())
    }
}
