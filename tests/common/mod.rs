use std::sync::Arc;

use rewards_ledger::types::{NewUser, User};
use rewards_ledger::{Ledger, MemoryLedger, RewardsService};
use rust_decimal::Decimal;

pub struct Fixture {
    pub ledger: Arc<MemoryLedger>,
    pub service: RewardsService,
}

pub fn fixture() -> Fixture {
    let ledger = Arc::new(MemoryLedger::new());
    let service = RewardsService::new(ledger.clone());
    Fixture { ledger, service }
}

#[allow(dead_code)]
pub fn new_user(name: &str, referral_code: Option<&str>) -> NewUser {
    NewUser {
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        referral_code: referral_code.map(str::to_string),
    }
}

impl Fixture {
    pub async fn register(&self, name: &str) -> User {
        self.service.register(new_user(name, None)).await.unwrap()
    }

    /// Credits `amount` to the user as a single completed task.
    pub async fn fund(&self, user: &User, amount: Decimal) {
        self.ledger.complete_task(user.id, amount).await.unwrap();
    }
}
