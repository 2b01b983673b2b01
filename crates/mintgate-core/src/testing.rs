//! In-process doubles for the chain and the chat platform, plus a small
//! two-collection directory used across the component tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::chain::ChainQuery;
use crate::context::{GateContext, GateSettings};
use crate::directory::{AssetDirectory, Collection};
use crate::ledger::Ledger;
use crate::messaging::{Messenger, UpdateSource};
use crate::shutdown::ShutdownController;
use crate::types::{ChatId, InboundEvent, ParseMode, UserId};

pub const ALPHA_CHAT: ChatId = -100;
pub const BETA_CHAT: ChatId = -200;
pub const ALPHA_LINK: &str = "https://t.me/+alpha";

/// Deterministic, valid mint address
pub fn mint(n: u8) -> String {
    Pubkey::new_from_array([n; 32]).to_string()
}

/// Deterministic wallet, never colliding with `mint(n)`
pub fn wallet(n: u8) -> Pubkey {
    let mut bytes = [n; 32];
    bytes[0] = 0xAA;
    Pubkey::new_from_array(bytes)
}

/// alpha: mints 1..=3, configured invite link. beta: mint 4, link created on demand.
pub fn directory() -> AssetDirectory {
    AssetDirectory::from_collections(vec![
        Collection {
            id: "alpha".into(),
            name: "Alpha".into(),
            chat_id: ALPHA_CHAT,
            invite_link: Some(ALPHA_LINK.into()),
            mints: [mint(1), mint(2), mint(3)].into_iter().collect(),
        },
        Collection {
            id: "beta".into(),
            name: "Beta".into(),
            chat_id: BETA_CHAT,
            invite_link: None,
            mints: [mint(4)].into_iter().collect(),
        },
    ])
    .unwrap()
}

pub struct Harness {
    pub ctx: GateContext,
    pub chain: Arc<FakeChain>,
    pub messenger: Arc<FakeMessenger>,
}

pub fn harness() -> Harness {
    let chain = Arc::new(FakeChain::new());
    let messenger = Arc::new(FakeMessenger::default());
    let ctx = GateContext::new(
        directory(),
        Ledger::in_memory().unwrap(),
        chain.clone(),
        messenger.clone(),
        GateSettings::default(),
    );
    Harness {
        ctx,
        chain,
        messenger,
    }
}

// ============================================================================
// Chain
// ============================================================================

type OwnerHook = Box<dyn Fn(&str) + Send + Sync>;
type BanHook = Box<dyn Fn(ChatId, UserId) + Send + Sync>;

pub struct FakeChain {
    holdings: Mutex<HashMap<Pubkey, BTreeSet<String>>>,
    owners: Mutex<HashMap<String, Option<Pubkey>>>,
    owner_errors: Mutex<HashSet<String>>,
    /// Lookups including any of these mints fail
    holding_errors: Mutex<HashSet<String>>,
    paid_after: Mutex<Option<Duration>>,
    transfer_errors: AtomicBool,
    started: Instant,
    transfer_queries: Mutex<Vec<(Instant, u64)>>,
    owner_hook: Mutex<Option<OwnerHook>>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            holdings: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            owner_errors: Mutex::new(HashSet::new()),
            holding_errors: Mutex::new(HashSet::new()),
            paid_after: Mutex::new(None),
            transfer_errors: AtomicBool::new(false),
            started: Instant::now(),
            transfer_queries: Mutex::new(Vec::new()),
            owner_hook: Mutex::new(None),
        }
    }

    pub fn hold(&self, wallet: Pubkey, mints: &[String]) {
        self.holdings
            .lock()
            .unwrap()
            .entry(wallet)
            .or_default()
            .extend(mints.iter().cloned());
    }

    pub fn set_owner(&self, mint: &str, owner: Option<Pubkey>) {
        self.owners.lock().unwrap().insert(mint.to_string(), owner);
    }

    /// Runs inside every owner lookup, before the answer is returned
    pub fn on_owner_lookup(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.owner_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_owner_lookup(&self, mint: &str) {
        self.owner_errors.lock().unwrap().insert(mint.to_string());
    }

    pub fn fail_holdings_lookup(&self, mint: &str) {
        self.holding_errors.lock().unwrap().insert(mint.to_string());
    }

    /// The self-transfer becomes visible `delay` after the fake was created
    pub fn pay_after(&self, delay: Duration) {
        *self.paid_after.lock().unwrap() = Some(delay);
    }

    pub fn fail_transfer_lookups(&self) {
        self.transfer_errors.store(true, Ordering::SeqCst);
    }

    /// (time, lamports) of every self-transfer lookup
    pub fn transfer_queries(&self) -> Vec<(Instant, u64)> {
        self.transfer_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainQuery for FakeChain {
    async fn owned_assets(&self, wallet: &Pubkey, candidates: &BTreeSet<String>) -> Result<Vec<String>> {
        let errors = self.holding_errors.lock().unwrap();
        if candidates.iter().any(|m| errors.contains(m)) {
            return Err(anyhow!("rpc unavailable"));
        }
        let holdings = self.holdings.lock().unwrap();
        Ok(holdings
            .get(wallet)
            .map(|held| held.intersection(candidates).cloned().collect())
            .unwrap_or_default())
    }

    async fn current_owner(&self, mint: &str) -> Result<Option<Pubkey>> {
        if let Some(hook) = self.owner_hook.lock().unwrap().as_ref() {
            hook(mint);
        }
        if self.owner_errors.lock().unwrap().contains(mint) {
            return Err(anyhow!("rpc unavailable"));
        }
        Ok(self.owners.lock().unwrap().get(mint).cloned().flatten())
    }

    async fn find_self_transfer(&self, _wallet: &Pubkey, lamports: u64, _since: i64) -> Result<bool> {
        let now = Instant::now();
        self.transfer_queries.lock().unwrap().push((now, lamports));
        if self.transfer_errors.load(Ordering::SeqCst) {
            return Err(anyhow!("rpc unavailable"));
        }
        let paid_after = *self.paid_after.lock().unwrap();
        Ok(paid_after.is_some_and(|delay| now.duration_since(self.started) >= delay))
    }
}

// ============================================================================
// Messenger
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Message { user: UserId, text: String },
    Approve { chat: ChatId, user: UserId },
    Decline { chat: ChatId, user: UserId },
    Ban { chat: ChatId, user: UserId },
    Unban { chat: ChatId, user: UserId },
    CreateInvite { chat: ChatId },
}

#[derive(Default)]
pub struct FakeMessenger {
    calls: Mutex<Vec<Call>>,
    failing_bans: Mutex<HashSet<UserId>>,
    invites_created: AtomicUsize,
    ban_hook: Mutex<Option<BanHook>>,
}

impl FakeMessenger {
    pub fn fail_bans_for(&self, user: UserId) {
        self.failing_bans.lock().unwrap().insert(user);
    }

    /// Runs inside every successful ban
    pub fn on_ban(&self, hook: impl Fn(ChatId, UserId) + Send + Sync + 'static) {
        *self.ban_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn allow_bans_for(&self, user: UserId) {
        self.failing_bans.lock().unwrap().remove(&user);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn messages_to(&self, user: UserId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Message { user: u, text } if u == user => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn bans(&self) -> Vec<(ChatId, UserId)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Ban { chat, user } => Some((chat, user)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.calls().iter().filter(|c| *c == wanted).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_message(&self, user: UserId, text: &str, _mode: ParseMode) -> Result<()> {
        self.record(Call::Message {
            user,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn approve_join(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.record(Call::Approve { chat, user });
        Ok(())
    }

    async fn decline_join(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.record(Call::Decline { chat, user });
        Ok(())
    }

    async fn ban(&self, chat: ChatId, user: UserId) -> Result<()> {
        if self.failing_bans.lock().unwrap().contains(&user) {
            return Err(anyhow!("Bad Request: not enough rights"));
        }
        if let Some(hook) = self.ban_hook.lock().unwrap().as_ref() {
            hook(chat, user);
        }
        self.record(Call::Ban { chat, user });
        Ok(())
    }

    async fn unban(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.record(Call::Unban { chat, user });
        Ok(())
    }

    async fn create_invite_link(&self, chat: ChatId, _name: &str) -> Result<String> {
        let n = self.invites_created.fetch_add(1, Ordering::SeqCst);
        self.record(Call::CreateInvite { chat });
        Ok(format!("https://t.me/+created{}", n))
    }
}

// ============================================================================
// Update source
// ============================================================================

/// Replays scripted batches, then triggers shutdown
pub struct FakeUpdates {
    batches: Mutex<VecDeque<Result<Vec<InboundEvent>>>>,
    offsets: Mutex<Vec<i64>>,
    shutdown: Arc<ShutdownController>,
}

impl FakeUpdates {
    pub fn new(batches: Vec<Result<Vec<InboundEvent>>>, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            offsets: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Offsets requested so far
    pub fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdateSource for FakeUpdates {
    async fn next_batch(&self, offset: i64, _timeout_secs: u64) -> Result<Vec<InboundEvent>> {
        self.offsets.lock().unwrap().push(offset);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => batch,
            None => {
                self.shutdown.shutdown();
                Ok(Vec::new())
            }
        }
    }
}
