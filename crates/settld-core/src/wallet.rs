use serde::{Deserialize, Serialize};

use crate::error::SettldError;
use crate::types::{AgentId, Cents, TenantId};

/// Per-agent ledger. All balances are non-negative at rest;
/// `availableCents + escrowLockedCents` equals credits minus final debits.
/// Mutated only through the atomic operations below.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub available_cents: Cents,
    pub escrow_locked_cents: Cents,
    pub total_debited_cents: Cents,
    pub currency: String,
}

impl Wallet {
    pub fn new(tenant_id: &str, agent_id: &str, currency: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
            available_cents: 0,
            escrow_locked_cents: 0,
            total_debited_cents: 0,
            currency: currency.to_string(),
        }
    }

    pub fn credit(&mut self, amount_cents: Cents) {
        self.available_cents += amount_cents;
    }

    /// Move funds from available into escrow.
    pub fn lock_escrow(&mut self, amount_cents: Cents) -> Result<(), SettldError> {
        if self.available_cents < amount_cents {
            return Err(SettldError::InsufficientFunds {
                need_cents: amount_cents,
                have_cents: self.available_cents,
            });
        }
        self.available_cents -= amount_cents;
        self.escrow_locked_cents += amount_cents;
        Ok(())
    }

    /// Remove settled funds from escrow; `debited` lands on `totalDebited`.
    pub fn debit_escrow(&mut self, amount_cents: Cents, debited: bool) -> Result<(), SettldError> {
        if self.escrow_locked_cents < amount_cents {
            return Err(SettldError::EscrowOverRelease {
                locked_cents: self.escrow_locked_cents,
                asked_cents: amount_cents,
            });
        }
        self.escrow_locked_cents -= amount_cents;
        if debited {
            self.total_debited_cents += amount_cents;
        }
        Ok(())
    }

    /// Return refunded escrow to available without debiting.
    pub fn refund_escrow(&mut self, amount_cents: Cents) -> Result<(), SettldError> {
        if self.escrow_locked_cents < amount_cents {
            return Err(SettldError::EscrowOverRelease {
                locked_cents: self.escrow_locked_cents,
                asked_cents: amount_cents,
            });
        }
        self.escrow_locked_cents -= amount_cents;
        self.available_cents += amount_cents;
        Ok(())
    }
}
