//! Transaction boundary around each chunk.

use std::sync::atomic::{AtomicU64, Ordering};

/// Handle of an open transaction.
#[derive(Debug, PartialEq, Eq)]
pub struct Transaction {
    id: u64,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Begins, commits and rolls back the transaction that wraps a chunk.
///
/// `commit` and `rollback` consume the handle, so a transaction is finished
/// exactly once.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> anyhow::Result<Transaction>;

    fn commit(&self, tx: Transaction) -> anyhow::Result<()>;

    fn rollback(&self, tx: Transaction) -> anyhow::Result<()>;
}

/// Transaction manager for steps without a transactional resource.
/// Only counts transactions.
#[derive(Debug, Default)]
pub struct ResourcelessTransactionManager {
    next_id: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl ResourcelessTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

impl TransactionManager for ResourcelessTransactionManager {
    fn begin(&self) -> anyhow::Result<Transaction> {
        Ok(Transaction::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn commit(&self, _tx: Transaction) -> anyhow::Result<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self, _tx: Transaction) -> anyhow::Result<()> {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
