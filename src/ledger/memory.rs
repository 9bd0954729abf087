use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Ledger, LedgerError, referral_codes, referral_codes_exhausted};
use crate::types::{
    LedgerAudit, NewUser, ProfileUpdate, Task, TaskFilter, TaskPage, TaskStatus, TaskType, User,
    Withdrawal, WithdrawalRequest, WithdrawalStatus,
};

/// A write step that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    TaskInsert,
    WithdrawalInsert,
    /// The counter update that follows a task or withdrawal insert.
    BalanceUpdate,
}

#[derive(Default)]
struct Store {
    users: HashMap<Uuid, User>,
    tasks: Vec<Task>,
    withdrawals: Vec<Withdrawal>,
    armed: Option<FailPoint>,
}

impl Store {
    fn trip(&mut self, point: FailPoint) -> Result<(), LedgerError> {
        if self.armed == Some(point) {
            self.armed = None;
            return Err(LedgerError::Unavailable(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn user_mut(&mut self, user_id: Uuid) -> Result<&mut User, LedgerError> {
        self.users
            .get_mut(&user_id)
            .ok_or(LedgerError::UserNotFound(user_id))
    }
}

/// A process-local ledger. Operations stage their writes and apply them only
/// once every step has succeeded.
#[derive(Default)]
pub struct MemoryLedger {
    store: Mutex<Store>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write reaching `point` fail.
    pub async fn fail_next(&self, point: FailPoint) {
        self.store.lock().await.armed = Some(point);
    }

    /// Registers a user with the first of `codes` that no one holds yet.
    pub(crate) async fn register_with_codes(
        &self,
        new_user: NewUser,
        referral_bonus: Decimal,
        codes: impl IntoIterator<Item = String>,
    ) -> Result<User, LedgerError> {
        let mut store = self.store.lock().await;

        if store.users.values().any(|u| u.email == new_user.email) {
            return Err(LedgerError::Conflict(format!(
                "email {} already registered",
                new_user.email
            )));
        }

        let referrer = match new_user.referral_code.as_deref() {
            Some(code) => {
                let found = store
                    .users
                    .values()
                    .find(|u| u.referral_code == code)
                    .map(|u| u.id);
                if found.is_none() {
                    warn!(code, "ignoring unknown referral code");
                }
                found
            }
            None => None,
        };

        let referral_code = codes
            .into_iter()
            .find(|code| !store.users.values().any(|u| &u.referral_code == code))
            .ok_or_else(referral_codes_exhausted)?;

        let user = User {
            id: Uuid::new_v4(),
            name: new_user.name,
            email: new_user.email,
            balance: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            referral_code,
            referral_count: 0,
            referral_earnings: Decimal::ZERO,
            tasks_completed: 0,
            referred_by: referrer,
            created_at: Utc::now(),
        };

        if let Some(referrer_id) = referrer {
            let r = store.user_mut(referrer_id)?;
            r.referral_count += 1;
            r.referral_earnings += referral_bonus;
            r.balance += referral_bonus;
            r.total_earned += referral_bonus;
            debug!(%referrer_id, "credited referral bonus");
        }

        store.users.insert(user.id, user.clone());
        Ok(user)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn register_user(
        &self,
        new_user: NewUser,
        referral_bonus: Decimal,
    ) -> Result<User, LedgerError> {
        self.register_with_codes(new_user, referral_bonus, referral_codes())
            .await
    }

    async fn get_user(&self, user_id: Uuid) -> Result<User, LedgerError> {
        let mut store = self.store.lock().await;
        store.user_mut(user_id).map(|u| u.clone())
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<User, LedgerError> {
        let mut store = self.store.lock().await;

        if let Some(email) = &update.email {
            if store
                .users
                .values()
                .any(|u| u.id != user_id && &u.email == email)
            {
                return Err(LedgerError::Conflict(format!("email {email} already registered")));
            }
        }

        let user = store.user_mut(user_id)?;
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        Ok(user.clone())
    }

    async fn complete_task(&self, user_id: Uuid, reward: Decimal) -> Result<Task, LedgerError> {
        let mut store = self.store.lock().await;
        store.user_mut(user_id)?;

        store.trip(FailPoint::TaskInsert)?;
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            user_id,
            task_type: TaskType::AdWatch,
            status: TaskStatus::Completed,
            reward,
            completed_at: Some(now),
            created_at: now,
        };
        store.trip(FailPoint::BalanceUpdate)?;

        let user = store.user_mut(user_id)?;
        user.balance += reward;
        user.total_earned += reward;
        user.tasks_completed += 1;
        store.tasks.push(task.clone());
        Ok(task)
    }

    async fn request_withdrawal(
        &self,
        user_id: Uuid,
        request: &WithdrawalRequest,
    ) -> Result<Withdrawal, LedgerError> {
        let mut store = self.store.lock().await;
        let balance = store.user_mut(user_id)?.balance;
        if balance < request.amount {
            return Err(LedgerError::InsufficientBalance {
                balance,
                requested: request.amount,
            });
        }

        store.trip(FailPoint::WithdrawalInsert)?;
        let withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            user_id,
            amount: request.amount,
            status: WithdrawalStatus::Pending,
            payment_method: request.payment_method,
            created_at: Utc::now(),
        };
        store.trip(FailPoint::BalanceUpdate)?;

        store.user_mut(user_id)?.balance -= request.amount;
        store.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn list_tasks(
        &self,
        user_id: Uuid,
        filter: &TaskFilter,
    ) -> Result<TaskPage, LedgerError> {
        let store = self.store.lock().await;
        let mut tasks: Vec<Task> = store
            .tasks
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id && filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(TaskPage::new(tasks))
    }

    async fn list_withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>, LedgerError> {
        let store = self.store.lock().await;
        let mut withdrawals: Vec<Withdrawal> = store
            .withdrawals
            .iter()
            .rev()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        withdrawals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(withdrawals)
    }

    async fn audit(&self, user_id: Uuid) -> Result<LedgerAudit, LedgerError> {
        let mut store = self.store.lock().await;
        let user = store.user_mut(user_id)?.clone();

        let completed: Vec<&Task> = store
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id && t.status == TaskStatus::Completed)
            .collect();
        let task_earnings: Decimal = completed.iter().map(|t| t.reward).sum();
        let withdrawn: Decimal = store
            .withdrawals
            .iter()
            .filter(|w| w.user_id == user_id && w.status != WithdrawalStatus::Failed)
            .map(|w| w.amount)
            .sum();
        let expected_total_earned = task_earnings + user.referral_earnings;

        Ok(LedgerAudit {
            user_id,
            balance: user.balance,
            expected_balance: expected_total_earned - withdrawn,
            total_earned: user.total_earned,
            expected_total_earned,
            withdrawn,
            tasks_completed: user.tasks_completed,
            task_records: completed.len() as i32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PaymentMethod;
    use rust_decimal_macros::dec;

    async fn seeded(ledger: &MemoryLedger) -> User {
        ledger
            .register_user(
                NewUser {
                    name: "Ada".into(),
                    email: "ada@example.com".into(),
                    referral_code: None,
                },
                dec!(1.00),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failed_counter_update_leaves_no_task() {
        let ledger = MemoryLedger::new();
        let user = seeded(&ledger).await;

        ledger.fail_next(FailPoint::BalanceUpdate).await;
        assert!(ledger.complete_task(user.id, dec!(0.10)).await.is_err());

        let after = ledger.get_user(user.id).await.unwrap();
        assert_eq!(after.balance, Decimal::ZERO);
        assert_eq!(after.tasks_completed, 0);
        assert_eq!(ledger.list_tasks(user.id, &TaskFilter::default()).await.unwrap().len(), 0);
        assert!(ledger.audit(user.id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn fail_point_fires_once() {
        let ledger = MemoryLedger::new();
        let user = seeded(&ledger).await;

        ledger.fail_next(FailPoint::TaskInsert).await;
        assert!(ledger.complete_task(user.id, dec!(0.10)).await.is_err());
        assert!(ledger.complete_task(user.id, dec!(0.10)).await.is_ok());
    }

    #[tokio::test]
    async fn overdraft_is_rejected_under_lock() {
        let ledger = MemoryLedger::new();
        let user = seeded(&ledger).await;
        let request = WithdrawalRequest {
            amount: dec!(5.00),
            payment_method: PaymentMethod::Bank,
        };

        let err = ledger.request_withdrawal(user.id, &request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert!(ledger.list_withdrawals(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let ledger = MemoryLedger::new();
        seeded(&ledger).await;
        let err = ledger
            .register_user(
                NewUser {
                    name: "Other".into(),
                    email: "ada@example.com".into(),
                    referral_code: None,
                },
                dec!(1.00),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn taken_referral_code_is_skipped() {
        let ledger = MemoryLedger::new();
        let ada = seeded(&ledger).await;
        let bob = NewUser {
            name: "Bob".into(),
            email: "bob@example.com".into(),
            referral_code: None,
        };

        let user = ledger
            .register_with_codes(
                bob.clone(),
                dec!(1.00),
                [ada.referral_code.clone(), "FRESH001".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(user.referral_code, "FRESH001");

        let err = ledger
            .register_with_codes(
                NewUser {
                    email: "bob2@example.com".into(),
                    ..bob
                },
                dec!(1.00),
                [ada.referral_code, "FRESH001".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(msg) if msg.contains("referral code")));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let ledger = MemoryLedger::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            ledger.get_user(id).await,
            Err(LedgerError::UserNotFound(missing)) if missing == id
        ));
    }
}
