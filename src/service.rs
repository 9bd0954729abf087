use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::ledger::{Ledger, LedgerError};
use crate::types::{
    LedgerAudit, LedgerEntry, NewUser, ProfileUpdate, Task, TaskFilter, TaskType, User, Withdrawal,
};
use crate::withdraw::{WithdrawalError, validate_withdrawal};
use crate::{DAILY_TASK_GOAL, RECENT_TASK_LIMIT, REFERRAL_BONUS};

#[derive(Debug, thiserror::Error)]
pub enum RewardsError {
    #[error(transparent)]
    Validation(#[from] WithdrawalError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// The headline numbers of the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_earned: Decimal,
    pub tasks_completed: i32,
    pub referral_count: i32,
}

/// Completed ad-watch tasks since UTC midnight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub tasks_completed: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub earnings: Decimal,
    pub goal: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarnOverview {
    pub today: DailyStats,
    pub recent_tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralStats {
    pub referral_code: String,
    pub referral_count: i32,
    #[serde(with = "rust_decimal::serde::str")]
    pub referral_earnings: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bonus_per_referral: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountView {
    pub name: String,
    pub email: String,
    pub member_since: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub lifetime_earnings: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub withdrawal: Withdrawal,
    /// The balance left after the withdrawal, as stored by the ledger.
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
}

/// Read models and write paths behind the rewards views.
#[derive(Clone)]
pub struct RewardsService {
    ledger: Arc<dyn Ledger>,
}

impl RewardsService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    #[instrument(skip(self, new_user), fields(email = %new_user.email))]
    pub async fn register(&self, new_user: NewUser) -> Result<User, RewardsError> {
        let user = self.ledger.register_user(new_user, REFERRAL_BONUS).await?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    pub async fn user(&self, user_id: Uuid) -> Result<User, RewardsError> {
        Ok(self.ledger.get_user(user_id).await?)
    }

    pub async fn dashboard(&self, user_id: Uuid) -> Result<DashboardSummary, RewardsError> {
        let user = self.ledger.get_user(user_id).await?;
        Ok(DashboardSummary {
            balance: user.balance,
            total_earned: user.total_earned,
            tasks_completed: user.tasks_completed,
            referral_count: user.referral_count,
        })
    }

    pub async fn today_stats(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DailyStats, RewardsError> {
        let filter = TaskFilter::completed_ad_watches().since(start_of_day(now));
        let page = self.ledger.list_tasks(user_id, &filter).await?;

        let (count, earnings) = page.fold((0u32, Decimal::ZERO), |(n, sum), task| {
            (n + 1, sum + task.reward)
        });
        Ok(DailyStats {
            tasks_completed: count,
            earnings,
            goal: DAILY_TASK_GOAL,
        })
    }

    pub async fn recent_tasks(&self, user_id: Uuid) -> Result<Vec<Task>, RewardsError> {
        let filter = TaskFilter {
            task_type: Some(TaskType::AdWatch),
            ..TaskFilter::default()
        }
        .limit(RECENT_TASK_LIMIT);
        Ok(self.ledger.list_tasks(user_id, &filter).await?.collect())
    }

    pub async fn earn_overview(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EarnOverview, RewardsError> {
        Ok(EarnOverview {
            today: self.today_stats(user_id, now).await?,
            recent_tasks: self.recent_tasks(user_id).await?,
        })
    }

    pub async fn tasks(
        &self,
        user_id: Uuid,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, RewardsError> {
        Ok(self.ledger.list_tasks(user_id, filter).await?.collect())
    }

    /// Validates the form against the current balance, then records the
    /// withdrawal. The ledger re-checks the balance under its own lock.
    #[instrument(skip(self, payment_method))]
    pub async fn request_withdrawal(
        &self,
        user_id: Uuid,
        amount: &str,
        payment_method: Option<&str>,
    ) -> Result<WithdrawalReceipt, RewardsError> {
        let user = self.ledger.get_user(user_id).await?;
        let request = validate_withdrawal(amount, payment_method, user.balance)?;

        let withdrawal = match self.ledger.request_withdrawal(user_id, &request).await {
            Ok(w) => w,
            Err(LedgerError::InsufficientBalance { .. }) => {
                return Err(WithdrawalError::InsufficientBalance.into());
            }
            Err(e) => return Err(e.into()),
        };
        let balance = self.ledger.get_user(user_id).await?.balance;

        info!(withdrawal_id = %withdrawal.id, amount = %withdrawal.amount, "withdrawal requested");
        Ok(WithdrawalReceipt {
            withdrawal,
            balance,
        })
    }

    pub async fn withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>, RewardsError> {
        Ok(self.ledger.list_withdrawals(user_id).await?)
    }

    pub async fn referrals(&self, user_id: Uuid) -> Result<ReferralStats, RewardsError> {
        let user = self.ledger.get_user(user_id).await?;
        Ok(ReferralStats {
            referral_code: user.referral_code,
            referral_count: user.referral_count,
            referral_earnings: user.referral_earnings,
            bonus_per_referral: REFERRAL_BONUS,
        })
    }

    pub async fn account(&self, user_id: Uuid) -> Result<AccountView, RewardsError> {
        let user = self.ledger.get_user(user_id).await?;
        Ok(account_view(user))
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<AccountView, RewardsError> {
        let user = if update.is_empty() {
            self.ledger.get_user(user_id).await?
        } else {
            self.ledger.update_profile(user_id, update).await?
        };
        Ok(account_view(user))
    }

    /// Tasks and withdrawals merged into one feed, newest first.
    pub async fn activity(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, RewardsError> {
        let tasks = self
            .ledger
            .list_tasks(user_id, &TaskFilter::default().limit(limit))
            .await?;
        let withdrawals = self.ledger.list_withdrawals(user_id).await?;

        let mut entries: Vec<LedgerEntry> = tasks
            .map(LedgerEntry::Task)
            .chain(withdrawals.into_iter().map(LedgerEntry::Withdrawal))
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.created_at()));
        entries.truncate(limit);
        Ok(entries)
    }

    pub async fn audit(&self, user_id: Uuid) -> Result<LedgerAudit, RewardsError> {
        Ok(self.ledger.audit(user_id).await?)
    }
}

fn account_view(user: User) -> AccountView {
    AccountView {
        name: user.name,
        email: user.email,
        member_since: user.created_at,
        lifetime_earnings: user.total_earned,
    }
}

/// UTC midnight of the day containing `now`.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_starts_at_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 17, 45, 12).unwrap();
        assert_eq!(
            start_of_day(now),
            Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap()
        );
    }
}
