use std::str::FromStr;

use rust_decimal::Decimal;

use crate::MIN_WITHDRAWAL;
use crate::types::{PaymentMethod, WithdrawalRequest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WithdrawalError {
    #[error("Enter a valid amount")]
    InvalidAmount,
    #[error("Minimum withdrawal amount is ${min}", min = MIN_WITHDRAWAL)]
    BelowMinimum,
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Please add a payment method")]
    MissingPaymentMethod,
    #[error("Unsupported payment method `{0}`")]
    UnknownPaymentMethod(String),
}

/// Checks a withdrawal form against the balance the user currently holds.
///
/// Checks run in a fixed order: amount shape, minimum, balance, then payment
/// method. The first failing check is reported.
pub fn validate_withdrawal(
    amount: &str,
    payment_method: Option<&str>,
    balance: Decimal,
) -> Result<WithdrawalRequest, WithdrawalError> {
    let amount = Decimal::from_str(amount.trim()).map_err(|_| WithdrawalError::InvalidAmount)?;
    if amount.normalize().scale() > 2 {
        return Err(WithdrawalError::InvalidAmount);
    }
    if amount < MIN_WITHDRAWAL {
        return Err(WithdrawalError::BelowMinimum);
    }
    if amount > balance {
        return Err(WithdrawalError::InsufficientBalance);
    }

    let payment_method = match payment_method.map(str::trim) {
        None | Some("") => return Err(WithdrawalError::MissingPaymentMethod),
        Some(method) => method
            .parse::<PaymentMethod>()
            .map_err(|_| WithdrawalError::UnknownPaymentMethod(method.to_string()))?,
    };

    Ok(WithdrawalRequest {
        amount: amount.round_dp(2),
        payment_method,
    })
}
