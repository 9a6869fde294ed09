//! Deterministic in-process collaborators. Two `TradeManager`s wired to the
//! same `TestChain` and `TestTransport` negotiate a whole trade without a
//! wallet, indexer or network.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bitcoin::{
    hashes::{sha256, Hash},
    Address, Amount, Network, Txid,
};
use secp256k1::{All, KeyPair, PublicKey, Secp256k1, SecretKey};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    common::{AddressEntry, FeePolicy, FiatAccount, PeerRef, SignedTx, TradeId, TxConfidence, UserIdentity},
    config::ProtocolConfig,
    error::FiatSwapError,
    manager::TradeManager,
    message::ProtocolMessage,
    model::NodeContext,
    offer::{Direction, Offer},
    persist::{FilePersistence, MemoryPersistence, Persistence},
    services::{
        BlockChainService, DepositInputs, DepositTxRequest, EcdsaSignatureService,
        MessageTransport, PayoutTerms, TradeServices, TradeTxKind, WalletService,
    },
    trade::{Trade, TradeState},
};

fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(error) => {
            panic!("Error reading test store - {}", error);
        }
    }
}

fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(error) => {
            panic!("Error writing test store - {}", error);
        }
    }
}

#[derive(Default)]
struct ChainStore {
    confidences: HashMap<Txid, TxConfidence>,
    subscribers: HashMap<Txid, Vec<mpsc::Sender<TxConfidence>>>,
    balances: HashMap<String, Amount>,
}

/// Shared view of the chain: transaction confidence and address balances.
#[derive(Clone, Default)]
pub struct TestChain {
    store: Arc<RwLock<ChainStore>>,
}

impl TestChain {
    const SUBSCRIPTION_CHANNEL_SIZE: usize = 16;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn confidence(&self, txid: &Txid) -> Option<TxConfidence> {
        read_guard(&self.store).confidences.get(txid).copied()
    }

    pub fn set_confidence(&self, txid: &Txid, confidence: TxConfidence) {
        let mut store = write_guard(&self.store);
        store.confidences.insert(*txid, confidence);
        if let Some(subscribers) = store.subscribers.get_mut(txid) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                if let Err(error) = tx.try_send(confidence) {
                    warn!("Confidence update for {} dropped - {}", txid, error);
                }
            }
        }
        trace!("Tx {} confidence now {:?}", txid, confidence);
    }

    /// Changes confidence behind the subscribers' back, as when the wallet
    /// learns of a block before any watch is told.
    pub fn set_confidence_unannounced(&self, txid: &Txid, confidence: TxConfidence) {
        write_guard(&self.store).confidences.insert(*txid, confidence);
        trace!("Tx {} confidence silently {:?}", txid, confidence);
    }

    /// Buries a transaction one block deep.
    pub fn mine(&self, txid: &Txid) {
        self.set_confidence(txid, TxConfidence::Building { depth: 1 });
    }

    pub fn subscribe(&self, txid: &Txid) -> mpsc::Receiver<TxConfidence> {
        let (tx, rx) = mpsc::channel(Self::SUBSCRIPTION_CHANNEL_SIZE);
        write_guard(&self.store)
            .subscribers
            .entry(*txid)
            .or_default()
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self, txid: &Txid) -> usize {
        read_guard(&self.store)
            .subscribers
            .get(txid)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn balance(&self, address: &str) -> Amount {
        read_guard(&self.store)
            .balances
            .get(address)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    pub fn credit(&self, address: &str, amount: Amount) {
        let mut store = write_guard(&self.store);
        let balance = store
            .balances
            .entry(address.to_owned())
            .or_insert(Amount::ZERO);
        *balance += amount;
    }

    pub fn debit(&self, address: &str, amount: Amount) -> Result<(), FiatSwapError> {
        let mut store = write_guard(&self.store);
        let balance = store
            .balances
            .entry(address.to_owned())
            .or_insert(Amount::ZERO);
        *balance = balance
            .checked_sub(amount)
            .ok_or(FiatSwapError::InsufficientFunds {
                needed: amount,
                available: *balance,
            })?;
        Ok(())
    }
}

#[derive(Default)]
struct WalletStore {
    broadcasts: HashMap<(TradeId, TradeTxKind), SignedTx>,
    broadcast_counts: HashMap<TradeTxKind, usize>,
    deposit_inputs: HashMap<TradeId, DepositInputs>,
    withdrawals: usize,
}

/// Wallet with keys derived from a seed and a single pool of spendable funds.
/// Every broadcast is remembered per trade so tasks can find it again.
pub struct TestWallet {
    secp: Secp256k1<All>,
    seed: [u8; 32],
    network: Network,
    chain: TestChain,
    funds: RwLock<Amount>,
    store: RwLock<WalletStore>,
}

impl TestWallet {
    pub const INITIAL_FUNDS: Amount = Amount::from_sat(500_000_000);

    pub fn new(secret_key: SecretKey) -> Self {
        Self::on_chain(secret_key, TestChain::new())
    }

    pub fn on_chain(secret_key: SecretKey, chain: TestChain) -> Self {
        Self {
            secp: Secp256k1::new(),
            seed: secret_key.secret_bytes(),
            network: Network::Regtest,
            chain,
            funds: RwLock::new(Self::INITIAL_FUNDS),
            store: RwLock::new(WalletStore::default()),
        }
    }

    pub fn chain(&self) -> &TestChain {
        &self.chain
    }

    pub fn funds(&self) -> Amount {
        *read_guard(&self.funds)
    }

    pub fn set_funds(&self, amount: Amount) {
        *write_guard(&self.funds) = amount;
    }

    pub fn set_confidence(&self, txid: &Txid, confidence: TxConfidence) {
        self.chain.set_confidence(txid, confidence);
    }

    pub fn confidence_subscriber_count(&self, txid: &Txid) -> usize {
        self.chain.subscriber_count(txid)
    }

    pub fn broadcast_count(&self, kind: TradeTxKind) -> usize {
        read_guard(&self.store)
            .broadcast_counts
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn withdrawal_count(&self) -> usize {
        read_guard(&self.store).withdrawals
    }

    fn derive_key_pair(&self, tag: &[u8]) -> KeyPair {
        let mut counter: u32 = 0;
        loop {
            let mut preimage = self.seed.to_vec();
            preimage.extend_from_slice(tag);
            preimage.extend_from_slice(&counter.to_le_bytes());
            let hash = sha256::Hash::hash(&preimage);
            if let Ok(secret_key) = SecretKey::from_slice(hash.as_ref()) {
                return KeyPair::from_secret_key(&self.secp, &secret_key);
            }
            counter += 1;
        }
    }

    fn entry_for(&self, key_pair: KeyPair) -> AddressEntry {
        let pub_key = key_pair.public_key();
        let address = Address::p2pkh(&bitcoin::PublicKey::new(pub_key), self.network);
        AddressEntry {
            address: address.to_string(),
            pub_key,
            key_pair,
        }
    }

    fn spend(&self, amount: Amount) -> Result<(), FiatSwapError> {
        let mut funds = write_guard(&self.funds);
        *funds = funds
            .checked_sub(amount)
            .ok_or(FiatSwapError::InsufficientFunds {
                needed: amount,
                available: *funds,
            })?;
        Ok(())
    }

    fn broadcast(&self, trade_id: TradeId, kind: TradeTxKind, raw: Vec<u8>) -> SignedTx {
        let signed_tx = SignedTx {
            txid: Txid::hash(&raw),
            raw,
        };
        {
            let mut store = write_guard(&self.store);
            store
                .broadcasts
                .insert((trade_id, kind), signed_tx.clone());
            *store.broadcast_counts.entry(kind).or_insert(0) += 1;
        }
        self.chain
            .set_confidence(&signed_tx.txid, TxConfidence::Pending);
        debug!(
            "Trade w/ TradeID {} broadcast {:?} tx {}",
            trade_id, kind, signed_tx.txid
        );
        signed_tx
    }
}

#[async_trait]
impl WalletService for TestWallet {
    fn address_entry(&self, trade_id: TradeId) -> AddressEntry {
        let mut tag = b"trade".to_vec();
        tag.extend_from_slice(trade_id.uuid().as_bytes());
        self.entry_for(self.derive_key_pair(&tag))
    }

    fn registration_address_entry(&self) -> AddressEntry {
        self.entry_for(self.derive_key_pair(b"registration"))
    }

    fn balance_for_address(&self, address: &str) -> Amount {
        self.chain.balance(address)
    }

    fn confidence_for_txid(&self, txid: &Txid) -> Option<TxConfidence> {
        self.chain.confidence(txid)
    }

    fn subscribe_tx_confidence(&self, txid: &Txid) -> mpsc::Receiver<TxConfidence> {
        self.chain.subscribe(txid)
    }

    fn find_trade_tx(&self, trade_id: TradeId, kind: TradeTxKind) -> Option<SignedTx> {
        read_guard(&self.store)
            .broadcasts
            .get(&(trade_id, kind))
            .cloned()
    }

    async fn pay_take_offer_fee(&self, trade_id: TradeId) -> Result<SignedTx, FiatSwapError> {
        self.spend(FeePolicy::TAKE_OFFER_FEE + FeePolicy::TX_FEE)?;
        let raw = format!("take-offer-fee:{}", trade_id).into_bytes();
        Ok(self.broadcast(trade_id, TradeTxKind::TakeOfferFee, raw))
    }

    async fn create_deposit_inputs(
        &self,
        trade_id: TradeId,
        contribution: Amount,
    ) -> Result<DepositInputs, FiatSwapError> {
        if let Some(inputs) = read_guard(&self.store).deposit_inputs.get(&trade_id) {
            return Ok(inputs.clone());
        }
        self.spend(contribution)?;
        let inputs = DepositInputs {
            raw: format!("deposit-inputs:{}:{}", trade_id, contribution.to_sat()).into_bytes(),
            contribution,
        };
        write_guard(&self.store)
            .deposit_inputs
            .insert(trade_id, inputs.clone());
        Ok(inputs)
    }

    async fn sign_and_publish_deposit_tx(
        &self,
        trade_id: TradeId,
        request: DepositTxRequest,
    ) -> Result<SignedTx, FiatSwapError> {
        self.spend(request.taker_contribution)?;
        let mut raw = request.offerer_inputs.raw.clone();
        raw.extend_from_slice(&request.offerer_pub_key.serialize());
        raw.extend_from_slice(&request.taker_pub_key.serialize());
        raw.extend_from_slice(&request.taker_contribution.to_sat().to_le_bytes());
        Ok(self.broadcast(trade_id, TradeTxKind::Deposit, raw))
    }

    fn payout_sighash(
        &self,
        deposit_tx: &SignedTx,
        terms: &PayoutTerms,
    ) -> Result<Vec<u8>, FiatSwapError> {
        let mut sighash = deposit_tx.txid.to_byte_array().to_vec();
        sighash.extend_from_slice(&serde_json::to_vec(terms)?);
        Ok(sighash)
    }

    async fn sign_and_publish_payout_tx(
        &self,
        trade_id: TradeId,
        deposit_tx: &SignedTx,
        terms: &PayoutTerms,
        offerer_signature: &[u8],
    ) -> Result<SignedTx, FiatSwapError> {
        let mut raw = self.payout_sighash(deposit_tx, terms)?;
        raw.extend_from_slice(offerer_signature);
        let payout_tx = self.broadcast(trade_id, TradeTxKind::Payout, raw);
        self.chain.credit(&terms.offerer_address, terms.offerer_amount);
        self.chain.credit(&terms.taker_address, terms.taker_amount);
        Ok(payout_tx)
    }

    async fn send_funds(
        &self,
        from_address: &str,
        to_address: &str,
        amount: Amount,
    ) -> Result<SignedTx, FiatSwapError> {
        self.chain.debit(from_address, amount + FeePolicy::TX_FEE)?;
        self.chain.credit(to_address, amount);
        let raw = format!("send:{}:{}:{}", from_address, to_address, amount.to_sat()).into_bytes();
        let signed_tx = SignedTx {
            txid: Txid::hash(&raw),
            raw,
        };
        self.chain
            .set_confidence(&signed_tx.txid, TxConfidence::Pending);
        write_guard(&self.store).withdrawals += 1;
        Ok(signed_tx)
    }
}

/// Every account is registered and clean unless a test says otherwise.
#[derive(Default)]
pub struct TestBlockChain {
    unregistered: RwLock<HashSet<String>>,
    black_listed: RwLock<HashSet<String>>,
}

impl TestBlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_registration(&self, account_id: impl Into<String>) {
        write_guard(&self.unregistered).insert(account_id.into());
    }

    pub fn black_list(&self, account_id: impl Into<String>) {
        write_guard(&self.black_listed).insert(account_id.into());
    }
}

impl BlockChainService for TestBlockChain {
    fn verify_account_registration(&self, account_id: &str) -> bool {
        !read_guard(&self.unregistered).contains(account_id)
    }

    fn is_account_black_listed(&self, account_id: &str, _fiat_account: &FiatAccount) -> bool {
        read_guard(&self.black_listed).contains(account_id)
    }
}

#[derive(Default)]
struct TransportStore {
    inboxes: HashMap<PeerRef, mpsc::UnboundedSender<ProtocolMessage>>,
    unreachable: HashSet<PeerRef>,
    blocked_kinds: HashSet<&'static str>,
    sent: Vec<(PeerRef, &'static str)>,
}

/// In-process message bus. Each connected peer gets an inbox drained by its
/// own delivery task, so a send never waits on the receiving trade.
#[derive(Clone, Default)]
pub struct TestTransport {
    store: Arc<RwLock<TransportStore>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer: PeerRef, manager: Arc<TradeManager>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProtocolMessage>();
        write_guard(&self.store).inboxes.insert(peer.clone(), tx);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if let Err(error) = manager.handle_message(message).await {
                    warn!("Peer {} could not handle {} - {}", peer, kind, error);
                }
            }
            debug!("Peer {} inbox closed", peer);
        })
    }

    /// Drops the peer's inbox, which ends its delivery task.
    pub fn disconnect(&self, peer: &PeerRef) {
        write_guard(&self.store).inboxes.remove(peer);
    }

    pub fn set_unreachable(&self, peer: &PeerRef, unreachable: bool) {
        let mut store = write_guard(&self.store);
        if unreachable {
            store.unreachable.insert(peer.clone());
        } else {
            store.unreachable.remove(peer);
        }
    }

    /// Fails every send of one message kind, whoever the peer.
    pub fn set_blocked(&self, kind: &'static str, blocked: bool) {
        let mut store = write_guard(&self.store);
        if blocked {
            store.blocked_kinds.insert(kind);
        } else {
            store.blocked_kinds.remove(kind);
        }
    }

    pub fn sent_count(&self, kind: &str) -> usize {
        read_guard(&self.store)
            .sent
            .iter()
            .filter(|(_, sent_kind)| *sent_kind == kind)
            .count()
    }
}

#[async_trait]
impl MessageTransport for TestTransport {
    async fn send_message(
        &self,
        peer: &PeerRef,
        message: ProtocolMessage,
    ) -> Result<(), FiatSwapError> {
        let mut store = write_guard(&self.store);
        if store.unreachable.contains(peer) {
            return Err(FiatSwapError::Transport {
                description: format!("peer {} unreachable", peer),
            });
        }
        let kind = message.kind();
        if store.blocked_kinds.contains(kind) {
            return Err(FiatSwapError::Transport {
                description: format!("peer {} unreachable for {}", peer, kind),
            });
        }
        let Some(inbox) = store.inboxes.get(peer) else {
            return Err(FiatSwapError::Transport {
                description: format!("no route to peer {}", peer),
            });
        };
        inbox.send(message).map_err(|error| FiatSwapError::Transport {
            description: format!("peer {} inbox closed - {}", peer, error),
        })?;
        store.sent.push((peer.clone(), kind));
        Ok(())
    }
}

pub struct SomeTestParams {}

impl SomeTestParams {
    fn secret_key(byte: u8) -> SecretKey {
        match SecretKey::from_slice(&[byte; 32]) {
            Ok(secret_key) => secret_key,
            Err(error) => panic!("Invalid test secret key - {}", error),
        }
    }

    fn peer(address: &str) -> PeerRef {
        match Url::parse(address) {
            Ok(url) => PeerRef::new(url),
            Err(error) => panic!("Invalid test peer address {} - {}", address, error),
        }
    }

    pub fn offerer_secret_key() -> SecretKey {
        Self::secret_key(0x21)
    }

    pub fn taker_secret_key() -> SecretKey {
        Self::secret_key(0x42)
    }

    pub fn offerer_peer() -> PeerRef {
        Self::peer("fiatswap://offerer.test:9000")
    }

    pub fn taker_peer() -> PeerRef {
        Self::peer("fiatswap://taker.test:9000")
    }

    pub fn message_pub_key(secret_key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), secret_key)
    }

    pub fn offerer_identity() -> UserIdentity {
        UserIdentity {
            account_id: "offerer-account".to_string(),
            message_pub_key: Self::message_pub_key(&Self::offerer_secret_key()),
            fiat_accounts: vec![FiatAccount {
                id: "offerer-sepa".to_string(),
                holder_name: "Olivia Offerer".to_string(),
                account_details: "DE89 3704 0044 0532 0130 00".to_string(),
            }],
        }
    }

    pub fn taker_identity() -> UserIdentity {
        UserIdentity {
            account_id: "taker-account".to_string(),
            message_pub_key: Self::message_pub_key(&Self::taker_secret_key()),
            fiat_accounts: vec![FiatAccount {
                id: "taker-sepa".to_string(),
                holder_name: "Theo Taker".to_string(),
                account_details: "FR14 2004 1010 0505 0001 3M02 606".to_string(),
            }],
        }
    }

    pub fn buy_offer() -> Offer {
        Offer {
            id: Uuid::from_u128(0x6f1c_2b7e_9a4d_4c1e_8f3a_51d2_c0ff_ee01),
            direction: Direction::Buy,
            amount: Amount::from_sat(1_000_000),
            min_amount: Amount::from_sat(500_000),
            price: 30_000.0,
            currency_code: "EUR".to_string(),
            security_deposit: Amount::from_sat(100_000),
            fiat_account_id: "offerer-sepa".to_string(),
            offerer_message_pub_key: Self::message_pub_key(&Self::offerer_secret_key()),
            offerer_peer: Self::offerer_peer(),
            creation_date: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }

    pub fn config() -> ProtocolConfig {
        ProtocolConfig {
            task_timeout: Some(Duration::from_secs(5)),
            notif_channel_size: 100,
            ..Default::default()
        }
    }

    pub fn config_in(data_dir: impl Into<PathBuf>) -> ProtocolConfig {
        ProtocolConfig {
            data_dir: data_dir.into(),
            ..Self::config()
        }
    }
}

/// One node's collaborators, kept accessible so tests can steer them.
pub struct TestNode {
    pub wallet: Arc<TestWallet>,
    pub block_chain: Arc<TestBlockChain>,
    pub transport: TestTransport,
    pub persistence: Arc<dyn Persistence>,
    pub context: NodeContext,
}

impl TestNode {
    pub fn offerer() -> Self {
        Self::offerer_on(TestChain::new(), TestTransport::new(), MemoryPersistence::new())
    }

    pub fn taker() -> Self {
        Self::taker_on(TestChain::new(), TestTransport::new(), MemoryPersistence::new())
    }

    pub fn offerer_on(
        chain: TestChain,
        transport: TestTransport,
        persistence: MemoryPersistence,
    ) -> Self {
        Self::build(
            SomeTestParams::offerer_secret_key(),
            SomeTestParams::offerer_identity(),
            SomeTestParams::offerer_peer(),
            chain,
            transport,
            Arc::new(persistence),
            SomeTestParams::config(),
        )
    }

    pub fn taker_on(
        chain: TestChain,
        transport: TestTransport,
        persistence: MemoryPersistence,
    ) -> Self {
        Self::build(
            SomeTestParams::taker_secret_key(),
            SomeTestParams::taker_identity(),
            SomeTestParams::taker_peer(),
            chain,
            transport,
            Arc::new(persistence),
            SomeTestParams::config(),
        )
    }

    /// An offerer whose trades are stored as files under `data_dir`. Must be
    /// built inside a runtime, the file store runs its own writer task.
    pub fn offerer_on_disk(
        chain: TestChain,
        transport: TestTransport,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let config = SomeTestParams::config_in(data_dir);
        Self::build(
            SomeTestParams::offerer_secret_key(),
            SomeTestParams::offerer_identity(),
            SomeTestParams::offerer_peer(),
            chain,
            transport,
            Arc::new(FilePersistence::from_config(&config)),
            config,
        )
    }

    fn build(
        secret_key: SecretKey,
        user: UserIdentity,
        local_peer: PeerRef,
        chain: TestChain,
        transport: TestTransport,
        persistence: Arc<dyn Persistence>,
        config: ProtocolConfig,
    ) -> Self {
        let wallet = Arc::new(TestWallet::on_chain(secret_key, chain));
        let block_chain = Arc::new(TestBlockChain::new());
        let services = TradeServices {
            wallet: wallet.clone(),
            block_chain: block_chain.clone(),
            signature: Arc::new(EcdsaSignatureService::new()),
            transport: Arc::new(transport.clone()),
            persistence: persistence.clone(),
        };
        let context = NodeContext {
            services,
            user,
            local_peer,
            config,
        };
        Self {
            wallet,
            block_chain,
            transport,
            persistence,
            context,
        }
    }

    /// A fresh manager over this node's collaborators, as after a restart.
    pub fn manager(&self) -> Arc<TradeManager> {
        Arc::new(TradeManager::new(self.context.clone()))
    }
}

/// Waits until the trade reaches `state`. Times out with the state it got
/// stuck in.
pub async fn wait_for_state(
    trade: &Trade,
    state: TradeState,
    within: Duration,
) -> Result<(), FiatSwapError> {
    let mut state_rx = trade.subscribe_state();
    let reached = timeout(within, state_rx.wait_for(|current| *current == state))
        .await
        .map(|result| result.map(|_| ()));
    match reached {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(FiatSwapError::ChannelClosed {
            description: error.to_string(),
        }),
        Err(_) => Err(FiatSwapError::simple(format!(
            "Trade w/ TradeID {} stuck in {} waiting for {}",
            trade.id(),
            trade.state(),
            state
        ))),
    }
}
