use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A rewards account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    /// The ID of the user.
    pub id: Uuid,
    /// The display name.
    pub name: String,
    /// The contact email, unique per user.
    pub email: String,
    /// The withdrawable balance.
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    /// Everything ever credited: task rewards plus referral bonuses.
    #[serde(with = "rust_decimal::serde::str")]
    pub total_earned: Decimal,
    /// The code other users sign up with.
    pub referral_code: String,
    /// How many users signed up with this user's code.
    pub referral_count: i32,
    /// The bonuses earned from referrals.
    #[serde(with = "rust_decimal::serde::str")]
    pub referral_earnings: Decimal,
    /// The number of completed reward tasks.
    pub tasks_completed: i32,
    /// The user whose code was used at sign up.
    pub referred_by: Option<Uuid>,
    /// The timestamp when the user was created.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AdWatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available,
    InProgress,
    Completed,
}

/// A reward task record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// The ID of the task.
    pub id: Uuid,
    /// The user the reward was credited to.
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub reward: Decimal,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Paypal,
    Bank,
}

/// A payout request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Withdrawal {
    /// The ID of the withdrawal.
    pub id: Uuid,
    /// The user who requested the payout.
    pub user_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
}

/// A validated withdrawal, ready to be written to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalRequest {
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
}

/// The data needed to create a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    /// A referral code to credit, if the user was invited.
    #[serde(default)]
    pub referral_code: Option<String>,
}

/// A partial profile update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none()
    }
}

/// Narrows a task listing. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    /// Only tasks created at or after this instant.
    pub created_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Completed ad-watch tasks, newest first.
    pub fn completed_ad_watches() -> Self {
        Self {
            task_type: Some(TaskType::AdWatch),
            status: Some(TaskStatus::Completed),
            ..Self::default()
        }
    }

    pub fn since(mut self, instant: DateTime<Utc>) -> Self {
        self.created_since = Some(instant);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.task_type.is_none_or(|t| t == task.task_type)
            && self.status.is_none_or(|s| s == task.status)
            && self.created_since.is_none_or(|since| task.created_at >= since)
    }
}

/// One page of tasks, newest first. Consumed once.
#[derive(Debug)]
pub struct TaskPage {
    tasks: std::vec::IntoIter<Task>,
}

impl TaskPage {
    pub(crate) fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter(),
        }
    }
}

impl Iterator for TaskPage {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        self.tasks.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.tasks.size_hint()
    }
}

impl ExactSizeIterator for TaskPage {}

/// What the ledger should hold for a user, recomputed from its records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerAudit {
    pub user_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub expected_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_earned: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub expected_total_earned: Decimal,
    /// Sum of withdrawals that have not failed.
    #[serde(with = "rust_decimal::serde::str")]
    pub withdrawn: Decimal,
    pub tasks_completed: i32,
    pub task_records: i32,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.expected_balance
            && self.total_earned == self.expected_total_earned
            && self.tasks_completed == self.task_records
    }
}

/// An entry of the merged activity feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Task(Task),
    Withdrawal(Withdrawal),
}

impl LedgerEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::Task(t) => t.created_at,
            LedgerEntry::Withdrawal(w) => w.created_at,
        }
    }

    /// Signed effect on the balance: rewards are credits, payouts debits.
    pub fn balance_delta(&self) -> Decimal {
        match self {
            LedgerEntry::Task(t) => match t.status {
                TaskStatus::Completed => t.reward,
                TaskStatus::Available | TaskStatus::InProgress => Decimal::ZERO,
            },
            LedgerEntry::Withdrawal(w) => match w.status {
                WithdrawalStatus::Pending | WithdrawalStatus::Completed => -w.amount,
                WithdrawalStatus::Failed => Decimal::ZERO,
            },
        }
    }
}

/// Raised when a stored label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(TaskType, "task type", { AdWatch => "ad_watch" });
text_enum!(TaskStatus, "task status", {
    Available => "available",
    InProgress => "in_progress",
    Completed => "completed",
});
text_enum!(WithdrawalStatus, "withdrawal status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});
text_enum!(PaymentMethod, "payment method", {
    Paypal => "paypal",
    Bank => "bank",
});

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn task_at(created_at: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            task_type: TaskType::AdWatch,
            status: TaskStatus::Completed,
            reward: dec!(0.10),
            completed_at: Some(created_at),
            created_at,
        }
    }

    #[test]
    fn labels_parse_back() {
        assert_eq!("in_progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!(PaymentMethod::Bank.to_string(), "bank");
        let err = "crypto".parse::<PaymentMethod>().unwrap_err();
        assert_eq!(err.to_string(), "unknown payment method `crypto`");
    }

    #[test]
    fn filter_respects_lower_bound() {
        let now = Utc::now();
        let filter = TaskFilter::completed_ad_watches().since(now);
        assert!(filter.matches(&task_at(now)));
        assert!(!filter.matches(&task_at(now - chrono::Duration::seconds(1))));
    }

    #[test]
    fn task_page_is_single_pass() {
        let mut page = TaskPage::new(vec![task_at(Utc::now()), task_at(Utc::now())]);
        assert_eq!(page.len(), 2);
        assert_eq!(page.by_ref().count(), 2);
        assert!(page.next().is_none());
    }

    #[test]
    fn failed_withdrawal_does_not_move_balance() {
        let withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: dec!(7.50),
            status: WithdrawalStatus::Failed,
            payment_method: PaymentMethod::Paypal,
            created_at: Utc::now(),
        };
        assert_eq!(LedgerEntry::Withdrawal(withdrawal.clone()).balance_delta(), Decimal::ZERO);
        let pending = Withdrawal {
            status: WithdrawalStatus::Pending,
            ..withdrawal
        };
        assert_eq!(LedgerEntry::Withdrawal(pending).balance_delta(), dec!(-7.50));
    }

    #[test]
    fn activity_entries_are_tagged() {
        let json = serde_json::to_value(LedgerEntry::Task(task_at(Utc::now()))).unwrap();
        assert_eq!(json["kind"], "task");
        assert_eq!(json["type"], "ad_watch");
        assert_eq!(json["reward"], "0.10");
    }
}
