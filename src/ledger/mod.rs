pub mod amount;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use amount::Amount;

// ── Entries ─────────────────────────────────────────────────────────

/// One charge from one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub call_id: String,
    pub amount: Amount,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// False when the provider returned no cost and zero was recorded.
    #[serde(default = "default_true")]
    pub reported: bool,
}

fn default_true() -> bool {
    true
}

impl CostEntry {
    pub fn usd(amount: Amount) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            amount,
            unit: "usd".into(),
            timestamp: Utc::now(),
            input_tokens: 0,
            output_tokens: 0,
            reported: true,
        }
    }
}

// ── Errors / receipts ───────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("episode {0} is not open in the ledger")]
    UnknownEpisode(String),

    #[error("episode {0} is already open in the ledger")]
    DuplicateEpisode(String),

    #[error("global cost ceiling reached: spent {spent} of {ceiling}")]
    GlobalBudgetExhausted { spent: Amount, ceiling: Amount },
}

/// Which ceiling a total has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ceiling {
    Episode,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub episode_total: Amount,
    pub global_total: Amount,
    /// Set once either ceiling is reached; the episode must stop.
    pub exceeded: Option<Ceiling>,
}

// ── Global budget ───────────────────────────────────────────────────

/// Spend shared by every episode of a run.
///
/// Charges always land (`fetch_add`); the ceiling is checked against the
/// result. A zero ceiling means unlimited.
#[derive(Debug)]
pub struct GlobalBudget {
    ceiling: u64,
    spent: AtomicU64,
}

impl GlobalBudget {
    pub fn new(ceiling: Amount) -> Self {
        Self {
            ceiling: to_counter(ceiling),
            spent: AtomicU64::new(0),
        }
    }

    /// Add `amount` and return the new total.
    pub fn charge(&self, amount: Amount) -> Amount {
        let delta = to_counter(amount);
        let previous = self.spent.fetch_add(delta, Ordering::AcqRel);
        from_counter(previous.saturating_add(delta))
    }

    pub fn spent(&self) -> Amount {
        from_counter(self.spent.load(Ordering::Acquire))
    }

    pub fn ceiling(&self) -> Amount {
        from_counter(self.ceiling)
    }

    pub fn is_exhausted(&self) -> bool {
        reached(self.spent(), self.ceiling())
    }
}

fn to_counter(amount: Amount) -> u64 {
    u64::try_from(amount.micros()).unwrap_or(0)
}

fn from_counter(micros: u64) -> Amount {
    Amount::from_micros(i64::try_from(micros).unwrap_or(i64::MAX))
}

/// Zero ceiling is unlimited; reaching the ceiling counts.
fn reached(total: Amount, ceiling: Amount) -> bool {
    !ceiling.is_zero() && total >= ceiling
}

// ── Ledger ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Account {
    ceiling: Amount,
    total: Amount,
    entries: Vec<CostEntry>,
}

/// Per-episode accounts plus the shared global budget.
///
/// Share one ledger across concurrent episodes with `Arc`. The account
/// map lock is only held for in-memory updates.
#[derive(Debug)]
pub struct CostLedger {
    global: GlobalBudget,
    accounts: Mutex<HashMap<String, Account>>,
}

impl CostLedger {
    pub fn new(global_ceiling: Amount) -> Self {
        Self {
            global: GlobalBudget::new(global_ceiling),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<String, Account>> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open an account for a new episode. Refused once the global ceiling
    /// has been reached.
    pub fn open_episode(&self, episode_id: &str, ceiling: Amount) -> Result<(), LedgerError> {
        if self.global.is_exhausted() {
            return Err(LedgerError::GlobalBudgetExhausted {
                spent: self.global.spent(),
                ceiling: self.global.ceiling(),
            });
        }
        let mut accounts = self.accounts();
        if accounts.contains_key(episode_id) {
            return Err(LedgerError::DuplicateEpisode(episode_id.to_string()));
        }
        accounts.insert(
            episode_id.to_string(),
            Account {
                ceiling,
                total: Amount::ZERO,
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    /// Drop the episode's account and return its final total. Its spend
    /// stays in the global total.
    pub fn close_episode(&self, episode_id: &str) -> Result<Amount, LedgerError> {
        self.accounts()
            .remove(episode_id)
            .map(|a| a.total)
            .ok_or_else(|| LedgerError::UnknownEpisode(episode_id.to_string()))
    }

    pub fn open_count(&self) -> usize {
        self.accounts().len()
    }

    /// Record a charge. The entry is kept even when a ceiling has
    /// already been crossed.
    pub fn charge(&self, episode_id: &str, entry: CostEntry) -> Result<ChargeReceipt, LedgerError> {
        let amount = entry.amount;
        let (episode_total, episode_ceiling) = {
            let mut accounts = self.accounts();
            let account = accounts
                .get_mut(episode_id)
                .ok_or_else(|| LedgerError::UnknownEpisode(episode_id.to_string()))?;
            account.total += amount;
            account.entries.push(entry);
            (account.total, account.ceiling)
        };
        let global_total = self.global.charge(amount);

        let exceeded = if reached(episode_total, episode_ceiling) {
            Some(Ceiling::Episode)
        } else if reached(global_total, self.global.ceiling()) {
            Some(Ceiling::Global)
        } else {
            None
        };

        tracing::debug!(
            episode = %episode_id,
            amount = %amount,
            episode_total = %episode_total,
            global_total = %global_total,
            "charged model call"
        );

        Ok(ChargeReceipt {
            episode_total,
            global_total,
            exceeded,
        })
    }

    /// Headroom under the tighter of the two ceilings. Negative once
    /// spend has gone over; [`Amount::UNLIMITED`] when neither applies.
    pub fn remaining(&self, episode_id: &str) -> Result<Amount, LedgerError> {
        let (total, ceiling) = self.account_totals(episode_id)?;
        let mut remaining = Amount::UNLIMITED;
        if !ceiling.is_zero() {
            remaining = remaining.min(ceiling - total);
        }
        let global_ceiling = self.global.ceiling();
        if !global_ceiling.is_zero() {
            remaining = remaining.min(global_ceiling - self.global.spent());
        }
        Ok(remaining)
    }

    /// The ceiling this episode has reached, if any.
    pub fn exceeded(&self, episode_id: &str) -> Result<Option<Ceiling>, LedgerError> {
        let (total, ceiling) = self.account_totals(episode_id)?;
        if reached(total, ceiling) {
            return Ok(Some(Ceiling::Episode));
        }
        if self.global.is_exhausted() {
            return Ok(Some(Ceiling::Global));
        }
        Ok(None)
    }

    pub fn is_exceeded(&self, episode_id: &str) -> bool {
        matches!(self.exceeded(episode_id), Ok(Some(_)))
    }

    pub fn episode_total(&self, episode_id: &str) -> Result<Amount, LedgerError> {
        Ok(self.account_totals(episode_id)?.0)
    }

    pub fn entries(&self, episode_id: &str) -> Result<Vec<CostEntry>, LedgerError> {
        self.accounts()
            .get(episode_id)
            .map(|a| a.entries.clone())
            .ok_or_else(|| LedgerError::UnknownEpisode(episode_id.to_string()))
    }

    pub fn global_spent(&self) -> Amount {
        self.global.spent()
    }

    pub fn global_exhausted(&self) -> bool {
        self.global.is_exhausted()
    }

    fn account_totals(&self, episode_id: &str) -> Result<(Amount, Amount), LedgerError> {
        self.accounts()
            .get(episode_id)
            .map(|a| (a.total, a.ceiling))
            .ok_or_else(|| LedgerError::UnknownEpisode(episode_id.to_string()))
    }
}
