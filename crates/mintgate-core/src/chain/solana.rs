//! ============================================================================
//! Solana Chain - NFT ownership + self-transfer lookups over JSON-RPC
//! ============================================================================
//! - Held NFTs: parsed SPL token accounts owned by the wallet
//! - Current holder: largest token account of the mint, then its owner
//! - Self-transfer: recent signatures of the wallet, decoded and scanned for
//!   a System Program transfer wallet -> wallet of the exact amount
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::CompiledInstruction,
    pubkey::Pubkey,
    signature::Signature,
    system_instruction::SystemInstruction,
};
use solana_transaction_status::UiTransactionEncoding;
use spl_token::solana_program::program_pack::Pack;
use spl_token::state::Account as TokenAccount;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::ChainQuery;

// System program ID (solana_sdk::system_program is deprecated)
const SYSTEM_PROGRAM_ID: Pubkey = solana_sdk::pubkey!("11111111111111111111111111111111");

/// How many recent signatures of the wallet are inspected per poll
const SIGNATURE_SCAN_LIMIT: usize = 25;

/// Signatures remembered as "already inspected, no match" before the memo is reset
const INSPECTED_MEMO_LIMIT: usize = 10_000;

/// Solana-backed implementation of [`ChainQuery`]
pub struct SolanaChain {
    rpc_client: RpcClient,
    /// Signatures already decoded during earlier polls that did not match
    inspected: Mutex<HashSet<(String, u64)>>,
}

impl SolanaChain {
    /// Create a new chain client for the given RPC endpoint
    pub fn new(rpc_url: &str) -> Self {
        info!("Initializing SolanaChain for {}", rpc_url);

        Self {
            rpc_client: RpcClient::new_with_commitment(
                rpc_url.to_string(),
                CommitmentConfig::confirmed(),
            ),
            inspected: Mutex::new(HashSet::new()),
        }
    }

    fn already_inspected(&self, signature: &str, lamports: u64) -> bool {
        let memo = self.inspected.lock().unwrap_or_else(|e| e.into_inner());
        memo.contains(&(signature.to_string(), lamports))
    }

    fn remember_inspected(&self, signature: &str, lamports: u64) {
        let mut memo = self.inspected.lock().unwrap_or_else(|e| e.into_inner());
        if memo.len() >= INSPECTED_MEMO_LIMIT {
            memo.clear();
        }
        memo.insert((signature.to_string(), lamports));
    }
}

#[async_trait]
impl ChainQuery for SolanaChain {
    async fn owned_assets(&self, wallet: &Pubkey, candidates: &BTreeSet<String>) -> Result<Vec<String>> {
        debug!("Listing token accounts of {}", wallet);

        let accounts = self
            .rpc_client
            .get_token_accounts_by_owner(wallet, TokenAccountsFilter::ProgramId(spl_token::id()))
            .await
            .map_err(|e| anyhow!("Failed to fetch token accounts for {}: {}", wallet, e))?;

        let mut owned = Vec::new();
        for keyed in &accounts {
            // jsonParsed layout: { parsed: { info: { mint, tokenAmount: { amount } } } }
            let data = serde_json::to_value(&keyed.account.data)?;
            let info = &data["parsed"]["info"];
            let Some(mint) = info["mint"].as_str() else {
                warn!("Token account {} has no parsed mint", keyed.pubkey);
                continue;
            };
            let amount = info["tokenAmount"]["amount"]
                .as_str()
                .and_then(|a| a.parse::<u64>().ok())
                .unwrap_or(0);

            if amount > 0 && candidates.contains(mint) {
                owned.push(mint.to_string());
            }
        }

        owned.sort();
        owned.dedup();
        debug!("Wallet {} holds {} of {} candidate mints", wallet, owned.len(), candidates.len());
        Ok(owned)
    }

    async fn current_owner(&self, mint: &str) -> Result<Option<Pubkey>> {
        let mint_key = Pubkey::from_str(mint)
            .map_err(|e| anyhow!("Invalid mint address {}: {}", mint, e))?;

        let largest = self
            .rpc_client
            .get_token_largest_accounts(&mint_key)
            .await
            .map_err(|e| anyhow!("Failed to fetch largest accounts for {}: {}", mint, e))?;

        let holder = largest.iter().find(|balance| {
            balance
                .amount
                .amount
                .parse::<u64>()
                .map(|a| a > 0)
                .unwrap_or(false)
        });

        let Some(holder) = holder else {
            debug!("Mint {} has no holder", mint);
            return Ok(None);
        };

        let token_account = Pubkey::from_str(&holder.address)
            .map_err(|e| anyhow!("Invalid token account {}: {}", holder.address, e))?;
        let account = self
            .rpc_client
            .get_account(&token_account)
            .await
            .map_err(|e| anyhow!("Failed to fetch token account {}: {}", token_account, e))?;

        let state = TokenAccount::unpack(&account.data)
            .map_err(|e| anyhow!("Failed to decode token account {}: {}", token_account, e))?;

        Ok(Some(state.owner))
    }

    async fn find_self_transfer(&self, wallet: &Pubkey, lamports: u64, since: i64) -> Result<bool> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until: None,
            limit: Some(SIGNATURE_SCAN_LIMIT),
            commitment: Some(CommitmentConfig::confirmed()),
        };

        let statuses = self
            .rpc_client
            .get_signatures_for_address_with_config(wallet, config)
            .await
            .map_err(|e| anyhow!("Failed to fetch signatures for {}: {}", wallet, e))?;

        // Newest first
        let candidates: Vec<String> = statuses
            .into_iter()
            .take_while(|status| status.block_time.map_or(true, |t| t >= since))
            .filter(|status| status.err.is_none() && !self.already_inspected(&status.signature, lamports))
            .map(|status| status.signature)
            .collect();

        let found = first_confirmed(candidates, |signature| {
            self.inspect_signature(signature, wallet, lamports)
        })
        .await;

        match found {
            Some(signature) => {
                info!("Found self-transfer of {} lamports from {} in {}", lamports, wallet, signature);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl SolanaChain {
    /// Fetch one transaction and check it for the self-transfer. A decoded
    /// transaction that doesn't match is remembered so later polls skip it.
    async fn inspect_signature(&self, raw: String, wallet: &Pubkey, lamports: u64) -> Result<bool> {
        let signature = Signature::from_str(&raw)
            .map_err(|e| anyhow!("Invalid signature {}: {}", raw, e))?;

        let tx = self
            .rpc_client
            .get_transaction_with_config(
                &signature,
                RpcTransactionConfig {
                    encoding: Some(UiTransactionEncoding::Base64),
                    commitment: Some(CommitmentConfig::confirmed()),
                    max_supported_transaction_version: Some(0),
                },
            )
            .await
            .map_err(|e| anyhow!("Failed to fetch transaction {}: {}", signature, e))?;

        let decoded = tx
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| anyhow!("Could not decode transaction {}", signature))?;

        if matches_self_transfer(
            decoded.message.static_account_keys(),
            decoded.message.instructions(),
            wallet,
            lamports,
        ) {
            return Ok(true);
        }

        self.remember_inspected(&raw, lamports);
        Ok(false)
    }
}

/// First signature whose inspection confirms the transfer. Signatures that
/// fail to inspect are skipped and left for the next poll.
async fn first_confirmed<I, F, Fut>(signatures: I, mut inspect: F) -> Option<String>
where
    I: IntoIterator<Item = String>,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for signature in signatures {
        match inspect(signature.clone()).await {
            Ok(true) => return Some(signature),
            Ok(false) => {}
            Err(e) => warn!("Skipping transaction {}: {}", signature, e),
        }
    }
    None
}

/// Whether any instruction is a System Program transfer of exactly
/// `lamports` from `wallet` to `wallet`
pub fn matches_self_transfer(
    account_keys: &[Pubkey],
    instructions: &[CompiledInstruction],
    wallet: &Pubkey,
    lamports: u64,
) -> bool {
    instructions.iter().any(|ix| {
        if account_keys.get(ix.program_id_index as usize) != Some(&SYSTEM_PROGRAM_ID) {
            return false;
        }
        let Ok(SystemInstruction::Transfer { lamports: amount }) =
            bincode::deserialize::<SystemInstruction>(&ix.data)
        else {
            return false;
        };
        if amount != lamports || ix.accounts.len() < 2 {
            return false;
        }

        let from = account_keys.get(ix.accounts[0] as usize);
        let to = account_keys.get(ix.accounts[1] as usize);
        from == Some(wallet) && to == Some(wallet)
    })
}
