// Settlement journaller: an append-only signed journal of every
// user-visible balance movement, plus the deposit/withdraw paths that
// mirror the on-chain collateral vault. Proof submission is an external
// collaborator reached through the ProofSink contract.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::repo::Repositories;
use crate::store::LockManager;
use crate::types::{DepositObserved, OnChainStatus, SettlementLog, SettlementType};
use crate::ws::messages::WsEvent;

/// External submitter relaying journal entries on-chain. The engine only
/// ever hands it a signed log and records the status it reports back.
#[async_trait]
pub trait ProofSink: Send + Sync {
    async fn submit(&self, log: &SettlementLog) -> anyhow::Result<()>;
}

/// Sink used when no chain gateway is wired up; entries stay PENDING.
pub struct NullProofSink;

#[async_trait]
impl ProofSink for NullProofSink {
    async fn submit(&self, _log: &SettlementLog) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Journal {
    repos: Repositories,
    events: broadcast::Sender<WsEvent>,
}

impl Journal {
    pub fn new(repos: Repositories, events: broadcast::Sender<WsEvent>) -> Self {
        Self { repos, events }
    }

    /// Append one signed journal entry and broadcast it to the trader's
    /// balance channel.
    pub async fn record(
        &self,
        trader: &str,
        token: Option<&str>,
        amount: i128,
        balance_before: i128,
        balance_after: i128,
        log_type: SettlementType,
        proof: Value,
    ) -> EngineResult<SettlementLog> {
        let mut log = SettlementLog {
            id: Uuid::new_v4(),
            trader: trader.to_string(),
            token: token.map(|t| t.to_string()),
            amount,
            balance_before,
            balance_after,
            log_type,
            on_chain_status: OnChainStatus::Pending,
            proof: proof.to_string(),
            signature: String::new(),
            created_at: Utc::now(),
        };
        log.signature = log.sign_digest();
        self.repos.settlements.append(&log).await?;
        let _ = self.events.send(WsEvent::Settlement {
            trader: trader.to_string(),
            log: log.clone(),
        });
        Ok(log)
    }
}

/// Settlement service: vault mirror plus proof-submission pump.
pub struct SettlementService {
    repos: Repositories,
    journal: Journal,
    locks: LockManager,
}

impl SettlementService {
    pub fn new(repos: Repositories, journal: Journal, locks: LockManager) -> Self {
        Self {
            repos,
            journal,
            locks,
        }
    }

    /// Apply a deposit observed on-chain to the wallet mirror.
    pub async fn apply_deposit(&self, event: &DepositObserved) -> EngineResult<()> {
        if event.amount <= 0 {
            return Err(EngineError::Validation("deposit amount must be positive".into()));
        }
        let key = self.repos.keys.lock(&format!("balance:{}", event.trader));
        let guard = self.locks.acquire(&key).await?;
        let mut balance = self.repos.balances.get(&event.trader).await?;
        let before = balance.wallet_balance;
        balance.wallet_balance += event.amount;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;
        self.journal
            .record(
                &event.trader,
                None,
                event.amount,
                before,
                balance.wallet_balance,
                SettlementType::Deposit,
                json!({ "block": event.block, "amount": event.amount.to_string() }),
            )
            .await?;
        guard.release().await;
        info!(
            "deposit {} applied for {} at block {}",
            event.amount, event.trader, event.block
        );
        Ok(())
    }

    /// Debit the wallet mirror and journal a withdrawal for the external
    /// submitter to relay. Fails when available balance cannot cover it.
    pub async fn request_withdraw(&self, trader: &str, amount: i128) -> EngineResult<SettlementLog> {
        if amount <= 0 {
            return Err(EngineError::Validation("withdraw amount must be positive".into()));
        }
        let key = self.repos.keys.lock(&format!("balance:{}", trader));
        let guard = self.locks.acquire(&key).await?;
        let mut balance = self.repos.balances.get(trader).await?;
        if balance.available() < amount {
            guard.release().await;
            return Err(EngineError::InsufficientBalance {
                required: amount,
                available: balance.available(),
            });
        }
        let before = balance.wallet_balance;
        balance.wallet_balance -= amount;
        balance.updated_at = Utc::now();
        self.repos.balances.save(&balance).await?;
        let log = self
            .journal
            .record(
                trader,
                None,
                -amount,
                before,
                balance.wallet_balance,
                SettlementType::Withdraw,
                json!({ "destination": trader, "amount": amount.to_string() }),
            )
            .await?;
        guard.release().await;
        Ok(log)
    }

    /// Push a pending journal entry through the proof sink and record the
    /// resulting status.
    pub async fn submit_proof(&self, sink: &dyn ProofSink, log: &SettlementLog) -> EngineResult<()> {
        self.repos
            .settlements
            .set_on_chain_status(&log.id, OnChainStatus::Submitted)
            .await?;
        match sink.submit(log).await {
            Ok(()) => {
                self.repos
                    .settlements
                    .set_on_chain_status(&log.id, OnChainStatus::Success)
                    .await
            }
            Err(e) => {
                warn!("proof submission failed for {}: {}", log.id, e);
                self.repos
                    .settlements
                    .set_on_chain_status(&log.id, OnChainStatus::Failed)
                    .await
            }
        }
    }
}
