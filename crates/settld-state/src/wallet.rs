use settld_core::{Cents, SettldError, Wallet, X402Gate};
use settld_crypto::sha256_hex;
use tracing::info;

use crate::engine::{wallet_pair_key, StateEngine};

impl StateEngine {
    /// Current wallet of an agent (zeroed wallet if never credited).
    pub fn wallet_of(&self, tenant: &str, agent_id: &str) -> Result<Wallet, SettldError> {
        Ok(self
            .db
            .get_wallet(tenant, agent_id)?
            .unwrap_or_else(|| Wallet::new(tenant, agent_id, "USD")))
    }

    /// Credit an agent's wallet. Idempotent on `idempotency_key`.
    pub fn credit_wallet(
        &self,
        tenant: &str,
        agent_id: &str,
        amount_cents: Cents,
        currency: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Wallet, SettldError> {
        self.require_agent(tenant, agent_id)?;

        let lock = self.locks.acquire(&format!("wallet:{tenant}:{agent_id}"));
        let _guard = lock.lock().expect("wallet lock");

        let scope = format!("wallet-credit:{agent_id}");
        let fingerprint = sha256_hex(format!("{amount_cents}:{currency}").as_bytes());
        if let Some(key) = idempotency_key {
            if let Some(stored) = self.replay_idempotent(tenant, &scope, key, &fingerprint)? {
                return Ok(stored);
            }
        }

        let mut wallet = self
            .db
            .get_wallet(tenant, agent_id)?
            .unwrap_or_else(|| Wallet::new(tenant, agent_id, currency));
        wallet.credit(amount_cents);
        self.db.put_wallet(&wallet)?;

        if let Some(key) = idempotency_key {
            self.store_idempotent(tenant, &scope, key, &fingerprint, &wallet)?;
        }
        info!(agent_id = %agent_id, amount_cents, "credited wallet");
        Ok(wallet)
    }

    // ── Escrow composites (called with the gate lock held) ───────────────────

    /// Lock the gate amount from the payer's available balance into escrow.
    pub(crate) fn lock_gate_escrow(&self, gate: &X402Gate) -> Result<(), SettldError> {
        let lock = self.locks.acquire(&format!(
            "wallet:{}:{}",
            gate.tenant_id, gate.payer_agent_id
        ));
        let _guard = lock.lock().expect("wallet lock");

        let mut payer = self.wallet_of(&gate.tenant_id, &gate.payer_agent_id)?;
        payer.lock_escrow(gate.amount_cents)?;
        self.db.put_wallet(&payer)
    }

    /// Settle a gate's escrow: `released` to the payee (debiting the payer),
    /// `refunded` back to the payer, `heldback` out of escrow into the
    /// holdback fund. `released + refunded + heldback` must equal the locked
    /// amount.
    pub(crate) fn settle_gate_escrow(
        &self,
        gate: &X402Gate,
        released: Cents,
        refunded: Cents,
        heldback: Cents,
    ) -> Result<(), SettldError> {
        if released + refunded + heldback != gate.locked_cents {
            return Err(SettldError::EscrowOverRelease {
                locked_cents: gate.locked_cents,
                asked_cents: released + refunded + heldback,
            });
        }

        let pair = wallet_pair_key(&gate.tenant_id, &gate.payer_agent_id, &gate.payee_agent_id);
        let lock = self.locks.acquire(&pair);
        let _guard = lock.lock().expect("wallet pair lock");

        let mut payer = self.wallet_of(&gate.tenant_id, &gate.payer_agent_id)?;
        payer.debit_escrow(released, true)?;
        payer.debit_escrow(heldback, false)?;
        payer.refund_escrow(refunded)?;

        let mut payee = self.wallet_of(&gate.tenant_id, &gate.payee_agent_id)?;
        payee.credit(released);

        self.db.put_wallet(&payer)?;
        self.db.put_wallet(&payee)?;
        info!(
            gate_id = %gate.gate_id,
            released, refunded, heldback,
            "settled gate escrow"
        );
        Ok(())
    }

    /// Pay holdback funds out to `target_agent_id`. When the target is the
    /// payee, the payer's final debit grows by the amount.
    pub(crate) fn pay_out_holdback(
        &self,
        gate: &X402Gate,
        target_agent_id: &str,
        amount_cents: Cents,
    ) -> Result<(), SettldError> {
        let pair = wallet_pair_key(&gate.tenant_id, &gate.payer_agent_id, target_agent_id);
        let lock = self.locks.acquire(&pair);
        let _guard = lock.lock().expect("wallet pair lock");

        let mut target = self.wallet_of(&gate.tenant_id, target_agent_id)?;
        target.credit(amount_cents);
        self.db.put_wallet(&target)?;

        if target_agent_id == gate.payee_agent_id {
            let mut payer = self.wallet_of(&gate.tenant_id, &gate.payer_agent_id)?;
            payer.total_debited_cents += amount_cents;
            self.db.put_wallet(&payer)?;
        }
        Ok(())
    }

    /// Return fully-locked escrow to the payer (gate cancel).
    pub(crate) fn unlock_gate_escrow(&self, gate: &X402Gate) -> Result<(), SettldError> {
        let lock = self.locks.acquire(&format!(
            "wallet:{}:{}",
            gate.tenant_id, gate.payer_agent_id
        ));
        let _guard = lock.lock().expect("wallet lock");

        let mut payer = self.wallet_of(&gate.tenant_id, &gate.payer_agent_id)?;
        payer.refund_escrow(gate.locked_cents)?;
        self.db.put_wallet(&payer)
    }
}
