use chrono::NaiveDate;
use fbop_shared::domain::{
    Child, ChildId, ChildWithBalance, FamilyId, Transaction, TransactionId,
};
use tracing::{debug, info};

use super::paths::{self, fields};
use super::{Observed, ProtocolError, SharedClock, load, load_all, observe, require_name};
use crate::store::{Data, Direction, Query, SharedStore, encode};

/// Children of a family and their transaction history. Balances are
/// always derived from transactions, never stored.
#[derive(Clone)]
pub struct Ledger {
    store: SharedStore,
    clock: SharedClock,
}

impl Ledger {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn create_child(&self, family_id: &FamilyId, name: &str) -> Result<Child, ProtocolError> {
        let name = require_name(name, "child")?;
        if self.store.get(&paths::family(family_id)?).await?.is_none() {
            return Err(ProtocolError::NotFound(format!("family {family_id}")));
        }
        let child = Child {
            id: ChildId::from(uuid::Uuid::new_v4().to_string()),
            name,
            created_at: self.clock.now(),
        };
        self.store
            .set(&paths::child(family_id, &child.id)?, encode(&child)?)
            .await?;
        info!(family_id = %family_id, child_id = %child.id, "child created");
        Ok(child)
    }

    pub async fn get_child(&self, family_id: &FamilyId, child_id: &ChildId) -> Result<Child, ProtocolError> {
        load(self.store.as_ref(), &paths::child(family_id, child_id)?)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("child {child_id}")))
    }

    pub async fn rename_child(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        name: &str,
    ) -> Result<(), ProtocolError> {
        let name = require_name(name, "child")?;
        let mut data = Data::new();
        data.insert(fields::NAME.into(), name.into());
        self.store
            .update(&paths::child(family_id, child_id)?, data)
            .await?;
        Ok(())
    }

    /// Removes only the child document. Its transactions and device grants
    /// stay behind as orphans.
    pub async fn delete_child(&self, family_id: &FamilyId, child_id: &ChildId) -> Result<(), ProtocolError> {
        self.store
            .delete(&paths::child(family_id, child_id)?)
            .await?;
        info!(family_id = %family_id, child_id = %child_id, "child deleted");
        Ok(())
    }

    fn children_query(&self, family_id: &FamilyId) -> Result<Query, ProtocolError> {
        Ok(Query::collection(paths::children(family_id)?).order_by(fields::CREATED_AT, Direction::Asc))
    }

    pub async fn list_children(&self, family_id: &FamilyId) -> Result<Vec<Child>, ProtocolError> {
        load_all(self.store.as_ref(), &self.children_query(family_id)?).await
    }

    pub fn observe_children(&self, family_id: &FamilyId) -> Result<Observed<Vec<Child>>, ProtocolError> {
        observe(self.store.as_ref(), self.children_query(family_id)?)
    }

    pub async fn child_with_balance(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
    ) -> Result<ChildWithBalance, ProtocolError> {
        let child = self.get_child(family_id, child_id).await?;
        let txs = self.list_transactions(family_id, child_id).await?;
        Ok(ChildWithBalance::new(child, txs))
    }

    pub async fn children_with_balances(
        &self,
        family_id: &FamilyId,
    ) -> Result<Vec<ChildWithBalance>, ProtocolError> {
        let mut out = Vec::new();
        for child in self.list_children(family_id).await? {
            let txs = self.list_transactions(family_id, &child.id).await?;
            out.push(ChildWithBalance::new(child, txs));
        }
        Ok(out)
    }

    /// Records a deposit (`amount >= 0`) or withdrawal (`amount < 0`).
    pub async fn create_transaction(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        amount_minor_units: i64,
        description: &str,
        effective_date: NaiveDate,
    ) -> Result<Transaction, ProtocolError> {
        // Fails with NotFound for unknown children.
        self.get_child(family_id, child_id).await?;
        let now = self.clock.now();
        let tx = Transaction {
            id: TransactionId::from(uuid::Uuid::new_v4().to_string()),
            amount_minor_units,
            description: description.trim().to_string(),
            effective_date,
            created_at: now,
            modified_at: now,
        };
        self.store
            .set(&paths::transaction(family_id, child_id, &tx.id)?, encode(&tx)?)
            .await?;
        debug!(
            family_id = %family_id,
            child_id = %child_id,
            tx_id = %tx.id,
            amount = amount_minor_units,
            "transaction recorded"
        );
        Ok(tx)
    }

    /// Rewrites the caller-editable fields; `createdAt` is preserved.
    pub async fn update_transaction(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        tx_id: &TransactionId,
        amount_minor_units: i64,
        description: &str,
        effective_date: NaiveDate,
    ) -> Result<Transaction, ProtocolError> {
        let path = paths::transaction(family_id, child_id, tx_id)?;
        let mut tx: Transaction = load(self.store.as_ref(), &path)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("transaction {tx_id}")))?;
        tx.amount_minor_units = amount_minor_units;
        tx.description = description.trim().to_string();
        tx.effective_date = effective_date;
        tx.modified_at = self.clock.now();
        self.store.update(&path, encode(&tx)?).await?;
        Ok(tx)
    }

    pub async fn delete_transaction(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
        tx_id: &TransactionId,
    ) -> Result<(), ProtocolError> {
        self.store
            .delete(&paths::transaction(family_id, child_id, tx_id)?)
            .await?;
        Ok(())
    }

    fn transactions_query(&self, family_id: &FamilyId, child_id: &ChildId) -> Result<Query, ProtocolError> {
        Ok(Query::collection(paths::transactions(family_id, child_id)?)
            .order_by(fields::EFFECTIVE_DATE, Direction::Desc))
    }

    /// Newest effective date first.
    pub async fn list_transactions(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
    ) -> Result<Vec<Transaction>, ProtocolError> {
        load_all(self.store.as_ref(), &self.transactions_query(family_id, child_id)?).await
    }

    pub fn observe_transactions(
        &self,
        family_id: &FamilyId,
        child_id: &ChildId,
    ) -> Result<Observed<Vec<Transaction>>, ProtocolError> {
        observe(self.store.as_ref(), self.transactions_query(family_id, child_id)?)
    }
}
