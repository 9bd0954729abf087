//! Durable per-user balances, reward tasks and withdrawals.
//!
//! Every operation that touches more than one row runs as a single unit:
//! either all of its writes land or none do.

mod memory;
mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

pub use memory::{FailPoint, MemoryLedger};
pub use postgres::PgLedger;

use crate::types::{
    LedgerAudit, NewUser, ProfileUpdate, Task, TaskFilter, TaskPage, UnknownVariant, User,
    Withdrawal, WithdrawalRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error("insufficient balance: {balance} available, {requested} requested")]
    InsufficientBalance { balance: Decimal, requested: Decimal },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] UnknownVariant),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates a user and credits the referrer whose code was given.
    async fn register_user(&self, new_user: NewUser, referral_bonus: Decimal)
    -> Result<User, LedgerError>;

    async fn get_user(&self, user_id: Uuid) -> Result<User, LedgerError>;

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<User, LedgerError>;

    /// Records a completed ad-watch task and credits its reward.
    async fn complete_task(&self, user_id: Uuid, reward: Decimal) -> Result<Task, LedgerError>;

    /// Records a pending withdrawal and debits the balance.
    async fn request_withdrawal(
        &self,
        user_id: Uuid,
        request: &WithdrawalRequest,
    ) -> Result<Withdrawal, LedgerError>;

    async fn list_tasks(&self, user_id: Uuid, filter: &TaskFilter)
    -> Result<TaskPage, LedgerError>;

    /// All withdrawals of a user, newest first.
    async fn list_withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>, LedgerError>;

    async fn audit(&self, user_id: Uuid) -> Result<LedgerAudit, LedgerError>;
}

/// How many fresh referral codes a registration tries before giving up.
const REFERRAL_CODE_ATTEMPTS: usize = 5;

/// Generates an eight character referral code.
pub(crate) fn new_referral_code() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

/// Candidate codes for one registration.
pub(crate) fn referral_codes() -> impl Iterator<Item = String> + Send {
    std::iter::repeat_with(new_referral_code as fn() -> String).take(REFERRAL_CODE_ATTEMPTS)
}

pub(crate) fn referral_codes_exhausted() -> LedgerError {
    LedgerError::Conflict("no unused referral code left, try again".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_codes_are_bounded_and_well_formed() {
        let codes: Vec<String> = referral_codes().collect();
        assert_eq!(codes.len(), REFERRAL_CODE_ATTEMPTS);
        for code in &codes {
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }
}
