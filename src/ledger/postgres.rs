use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Acquire, PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Ledger, LedgerError, referral_codes, referral_codes_exhausted};
use crate::types::{
    LedgerAudit, NewUser, ProfileUpdate, Task, TaskFilter, TaskPage, TaskStatus, TaskType, User,
    Withdrawal, WithdrawalRequest, WithdrawalStatus,
};

// NOTE: 23505 = unique_violation
const UNIQUE_VIOLATION: &str = "23505";
const REFERRAL_CODE_KEY: &str = "users_referral_code_key";

const USER_COLUMNS: &str = "id, name, email, balance, total_earned, referral_code, referral_count, \
     referral_earnings, tasks_completed, referred_by, created_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    balance: Decimal,
    total_earned: Decimal,
    referral_code: String,
    referral_count: i32,
    referral_earnings: Decimal,
    tasks_completed: i32,
    referred_by: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        User {
            id: r.id,
            name: r.name,
            email: r.email,
            balance: r.balance,
            total_earned: r.total_earned,
            referral_code: r.referral_code,
            referral_count: r.referral_count,
            referral_earnings: r.referral_earnings,
            tasks_completed: r.tasks_completed,
            referred_by: r.referred_by,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    user_id: Uuid,
    task_type: String,
    status: String,
    reward: Decimal,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = LedgerError;

    fn try_from(r: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: r.id,
            user_id: r.user_id,
            task_type: r.task_type.parse()?,
            status: r.status.parse()?,
            reward: r.reward,
            completed_at: r.completed_at,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    status: String,
    payment_method: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for Withdrawal {
    type Error = LedgerError;

    fn try_from(r: WithdrawalRow) -> Result<Self, Self::Error> {
        Ok(Withdrawal {
            id: r.id,
            user_id: r.user_id,
            amount: r.amount,
            status: r.status.parse()?,
            payment_method: r.payment_method.parse()?,
            created_at: r.created_at,
        })
    }
}

/// The PostgreSQL-backed ledger. Multi-row writes share one transaction and
/// lock the user row first, so concurrent writers for a user serialize.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

/// The unique constraint `e` violated, if any.
fn violated_unique(e: &sqlx::Error) -> Option<&str> {
    match e {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            Some(db_err.constraint().unwrap_or_default())
        }
        _ => None,
    }
}

fn map_conflict(e: sqlx::Error, what: &str) -> LedgerError {
    if violated_unique(&e).is_some() {
        return LedgerError::Conflict(format!("{what} already exists"));
    }
    LedgerError::Database(e)
}

async fn lock_user(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<User, LedgerError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(user_id)
        .fetch_optional(tx.as_mut())
        .await?;
    row.map(User::from).ok_or(LedgerError::UserNotFound(user_id))
}

async fn referrer_by_code(
    tx: &mut Transaction<'_, Postgres>,
    code: &str,
) -> Result<Option<Uuid>, LedgerError> {
    let id = sqlx::query_scalar::<_, Uuid>(
        r#"SELECT id FROM users WHERE referral_code = $1 FOR UPDATE"#,
    )
    .bind(code)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(id)
}

async fn credit_referrer(
    tx: &mut Transaction<'_, Postgres>,
    referrer_id: Uuid,
    bonus: Decimal,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"UPDATE users
           SET referral_count = referral_count + 1,
               referral_earnings = referral_earnings + $2,
               balance = balance + $2,
               total_earned = total_earned + $2
           WHERE id = $1"#,
    )
    .bind(referrer_id)
    .bind(bonus)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

impl PgLedger {
    /// Registers a user with the first of `codes` that does not collide with
    /// an existing referral code. Each attempt runs in its own savepoint.
    pub(crate) async fn register_with_codes(
        &self,
        new_user: NewUser,
        referral_bonus: Decimal,
        codes: impl IntoIterator<Item = String>,
    ) -> Result<User, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let referrer = match new_user.referral_code.as_deref() {
            Some(code) => {
                let found = referrer_by_code(&mut tx, code).await?;
                if found.is_none() {
                    warn!(code, "ignoring unknown referral code");
                }
                found
            }
            None => None,
        };

        let sql = format!(
            "INSERT INTO users (id, name, email, referral_code, referred_by) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        );
        let mut inserted = None;
        for code in codes {
            let mut attempt = tx.begin().await?;
            let result = sqlx::query_as::<_, UserRow>(&sql)
                .bind(Uuid::new_v4())
                .bind(&new_user.name)
                .bind(&new_user.email)
                .bind(&code)
                .bind(referrer)
                .fetch_one(attempt.as_mut())
                .await;
            match result {
                Ok(row) => {
                    attempt.commit().await?;
                    inserted = Some(row);
                    break;
                }
                Err(e) if violated_unique(&e) == Some(REFERRAL_CODE_KEY) => {
                    attempt.rollback().await?;
                    debug!(%code, "referral code taken, retrying");
                }
                Err(e) => return Err(map_conflict(e, "email")),
            }
        }
        let row = inserted.ok_or_else(referral_codes_exhausted)?;

        if let Some(referrer_id) = referrer {
            credit_referrer(&mut tx, referrer_id, referral_bonus).await?;
            debug!(%referrer_id, "credited referral bonus");
        }

        tx.commit().await?;
        Ok(row.into())
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn register_user(
        &self,
        new_user: NewUser,
        referral_bonus: Decimal,
    ) -> Result<User, LedgerError> {
        self.register_with_codes(new_user, referral_bonus, referral_codes())
            .await
    }

    async fn get_user(&self, user_id: Uuid) -> Result<User, LedgerError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::from).ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<User, LedgerError> {
        let sql = format!(
            "UPDATE users SET name = COALESCE($2, name), email = COALESCE($3, email) \
             WHERE id = $1 RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user_id)
            .bind(update.name)
            .bind(update.email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_conflict(e, "email"))?;
        row.map(User::from).ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn complete_task(&self, user_id: Uuid, reward: Decimal) -> Result<Task, LedgerError> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, user_id).await?;

        let now = Utc::now();
        let row = sqlx::query_as::<_, TaskRow>(
            r#"INSERT INTO tasks (id, user_id, task_type, status, reward, completed_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $6)
               RETURNING id, user_id, task_type, status, reward, completed_at, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(TaskType::AdWatch.as_str())
        .bind(TaskStatus::Completed.as_str())
        .bind(reward)
        .bind(now)
        .fetch_one(tx.as_mut())
        .await?;

        sqlx::query(
            r#"UPDATE users
               SET balance = balance + $2,
                   total_earned = total_earned + $2,
                   tasks_completed = tasks_completed + 1
               WHERE id = $1"#,
        )
        .bind(user_id)
        .bind(reward)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn request_withdrawal(
        &self,
        user_id: Uuid,
        request: &WithdrawalRequest,
    ) -> Result<Withdrawal, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let user = lock_user(&mut tx, user_id).await?;

        if user.balance < request.amount {
            tx.commit().await?;
            return Err(LedgerError::InsufficientBalance {
                balance: user.balance,
                requested: request.amount,
            });
        }

        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"INSERT INTO withdrawals (id, user_id, amount, status, payment_method)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id, user_id, amount, status, payment_method, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(request.amount)
        .bind(WithdrawalStatus::Pending.as_str())
        .bind(request.payment_method.as_str())
        .fetch_one(tx.as_mut())
        .await?;

        sqlx::query(r#"UPDATE users SET balance = balance - $2 WHERE id = $1"#)
            .bind(user_id)
            .bind(request.amount)
            .execute(tx.as_mut())
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn list_tasks(
        &self,
        user_id: Uuid,
        filter: &TaskFilter,
    ) -> Result<TaskPage, LedgerError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, user_id, task_type, status, reward, completed_at, created_at \
             FROM tasks WHERE user_id = ",
        );
        qb.push_bind(user_id);
        if let Some(task_type) = filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = filter.created_since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await?;
        let tasks = rows
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TaskPage::new(tasks))
    }

    async fn list_withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>, LedgerError> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"SELECT id, user_id, amount, status, payment_method, created_at
               FROM withdrawals WHERE user_id = $1 ORDER BY created_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Withdrawal::try_from).collect()
    }

    async fn audit(&self, user_id: Uuid) -> Result<LedgerAudit, LedgerError> {
        // REPEATABLE READ so the sums and the user row come from one snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(tx.as_mut())
            .await?;

        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user: User = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user_id)
            .fetch_optional(tx.as_mut())
            .await?
            .map(User::from)
            .ok_or(LedgerError::UserNotFound(user_id))?;

        let (task_earnings, task_records): (Decimal, i64) = sqlx::query_as(
            r#"SELECT COALESCE(SUM(reward), 0), COUNT(*)
               FROM tasks WHERE user_id = $1 AND status = $2"#,
        )
        .bind(user_id)
        .bind(TaskStatus::Completed.as_str())
        .fetch_one(tx.as_mut())
        .await?;

        let withdrawn: Decimal = sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(amount), 0)
               FROM withdrawals WHERE user_id = $1 AND status <> $2"#,
        )
        .bind(user_id)
        .bind(WithdrawalStatus::Failed.as_str())
        .fetch_one(tx.as_mut())
        .await?;

        tx.commit().await?;

        let expected_total_earned = task_earnings + user.referral_earnings;
        Ok(LedgerAudit {
            user_id,
            balance: user.balance,
            expected_balance: expected_total_earned - withdrawn,
            total_earned: user.total_earned,
            expected_total_earned,
            withdrawn,
            tasks_completed: user.tasks_completed,
            task_records: task_records as i32,
        })
    }
}
