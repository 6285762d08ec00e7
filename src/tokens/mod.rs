//! Billing-token ledger: daily/monthly windows, per-feature costs, and a
//! transaction log. These are billing units, not LM tokens.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::TokenBalance;
use crate::db::DbPool;

const DEFAULT_FEATURE_COST: i64 = 1;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient tokens: need {needed}, {remaining} remaining")]
    Insufficient { needed: i64, remaining: i64 },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Serialize)]
pub struct TokenStatus {
    pub daily_used: i64,
    pub daily_limit: i64,
    pub daily_remaining: i64,
    pub monthly_used: i64,
    pub monthly_limit: i64,
    pub monthly_remaining: i64,
}

impl From<&TokenBalance> for TokenStatus {
    fn from(b: &TokenBalance) -> Self {
        Self {
            daily_used: b.daily_used,
            daily_limit: b.daily_limit,
            daily_remaining: (b.daily_limit - b.daily_used).max(0),
            monthly_used: b.monthly_used,
            monthly_limit: b.monthly_limit,
            monthly_remaining: (b.monthly_limit - b.monthly_used).max(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Deduction {
    pub cost: i64,
    pub status: TokenStatus,
}

fn day_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn month_key() -> String {
    Utc::now().format("%Y-%m").to_string()
}

#[derive(Clone)]
pub struct TokenLedger {
    db: DbPool,
}

impl TokenLedger {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Load the user's balance, creating it with default limits on first use
    /// and rolling the usage windows over when the UTC day or month changed.
    pub async fn ensure_balance(&self, user_id: &str) -> Result<TokenBalance, LedgerError> {
        let today = day_key();
        let month = month_key();

        sqlx::query(
            "INSERT OR IGNORE INTO token_balances (user_id, day_key, month_key) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(&today)
        .bind(&month)
        .execute(&self.db)
        .await?;

        let balance: TokenBalance =
            sqlx::query_as("SELECT * FROM token_balances WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.db)
                .await?;

        if balance.day_key == today && balance.month_key == month {
            return Ok(balance);
        }

        // Window rollover; the monthly reset implies a daily one.
        let (daily_used, monthly_used) = if balance.month_key != month {
            (0, 0)
        } else {
            (0, balance.monthly_used)
        };
        sqlx::query(
            "UPDATE token_balances
             SET daily_used = ?, monthly_used = ?, day_key = ?, month_key = ?,
                 updated_at = datetime('now')
             WHERE user_id = ?",
        )
        .bind(daily_used)
        .bind(monthly_used)
        .bind(&today)
        .bind(&month)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(TokenBalance {
            daily_used,
            monthly_used,
            day_key: today,
            month_key: month,
            ..balance
        })
    }

    pub async fn status(&self, user_id: &str) -> Result<TokenStatus, LedgerError> {
        let balance = self.ensure_balance(user_id).await?;
        Ok(TokenStatus::from(&balance))
    }

    /// Cost of an active feature; unknown or inactive features cost the default.
    pub async fn feature_cost(&self, feature: &str) -> Result<i64, LedgerError> {
        let cost: Option<(i64,)> =
            sqlx::query_as("SELECT base_cost FROM feature_costs WHERE feature = ? AND active = 1")
                .bind(feature)
                .fetch_optional(&self.db)
                .await?;
        Ok(cost.map(|(c,)| c).unwrap_or(DEFAULT_FEATURE_COST))
    }

    /// Check both windows without spending.
    pub async fn check(&self, user_id: &str, needed: i64) -> Result<TokenStatus, LedgerError> {
        let balance = self.ensure_balance(user_id).await?;
        let status = TokenStatus::from(&balance);
        let remaining = status.daily_remaining.min(status.monthly_remaining);
        if needed > remaining {
            return Err(LedgerError::Insufficient { needed, remaining });
        }
        Ok(status)
    }

    /// Spend the feature's cost, or fail with no partial effect. Failed
    /// attempts are logged to the transaction table as well.
    pub async fn deduct(
        &self,
        user_id: &str,
        feature: &str,
        context: &serde_json::Value,
    ) -> Result<Deduction, LedgerError> {
        let cost = self.feature_cost(feature).await?;
        self.ensure_balance(user_id).await?;

        // The sufficiency check lives in the UPDATE itself: concurrent
        // deducts race to the row, and whichever lands second sees the new
        // counters and matches nothing.
        let mut tx = self.db.begin().await?;
        let updated = sqlx::query(
            "UPDATE token_balances
             SET daily_used = daily_used + ?, monthly_used = monthly_used + ?,
                 updated_at = datetime('now')
             WHERE user_id = ?
               AND daily_used + ? <= daily_limit
               AND monthly_used + ? <= monthly_limit",
        )
        .bind(cost)
        .bind(cost)
        .bind(user_id)
        .bind(cost)
        .bind(cost)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let balance = self.ensure_balance(user_id).await?;
            let status = TokenStatus::from(&balance);
            let remaining = status.daily_remaining.min(status.monthly_remaining);
            self.record_transaction(
                user_id,
                "deduct",
                cost,
                feature,
                context,
                false,
                Some("insufficient tokens"),
            )
            .await?;
            return Err(LedgerError::Insufficient {
                needed: cost,
                remaining,
            });
        }

        sqlx::query(
            "INSERT INTO token_transactions (id, user_id, operation, amount, feature, context)
             VALUES (?, ?, 'deduct', ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(cost)
        .bind(feature)
        .bind(context.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let balance = self.ensure_balance(user_id).await?;
        Ok(Deduction {
            cost,
            status: TokenStatus::from(&balance),
        })
    }

    /// Credit back up to what was used in the current windows (floor at 0).
    pub async fn refund(
        &self,
        user_id: &str,
        feature: &str,
        amount: i64,
        context: &serde_json::Value,
    ) -> Result<TokenStatus, LedgerError> {
        let balance = self.ensure_balance(user_id).await?;
        let credited = amount.max(0);
        let daily = (balance.daily_used - credited).max(0);
        let monthly = (balance.monthly_used - credited).max(0);

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE token_balances
             SET daily_used = ?, monthly_used = ?, updated_at = datetime('now')
             WHERE user_id = ?",
        )
        .bind(daily)
        .bind(monthly)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO token_transactions (id, user_id, operation, amount, feature, context)
             VALUES (?, ?, 'refund', ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(credited)
        .bind(feature)
        .bind(context.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.status(user_id).await
    }

    /// Raise the monthly limit, e.g. after a completed checkout.
    pub async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        feature: &str,
        context: &serde_json::Value,
    ) -> Result<TokenStatus, LedgerError> {
        self.ensure_balance(user_id).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "UPDATE token_balances
             SET monthly_limit = monthly_limit + ?, updated_at = datetime('now')
             WHERE user_id = ?",
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO token_transactions (id, user_id, operation, amount, feature, context)
             VALUES (?, ?, 'grant', ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(amount)
        .bind(feature)
        .bind(context.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.status(user_id).await
    }

    pub async fn recent_transactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<crate::db::models::TokenTransaction>, LedgerError> {
        let rows = sqlx::query_as(
            "SELECT * FROM token_transactions WHERE user_id = ?
             ORDER BY created_at DESC, id LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn record_transaction(
        &self,
        user_id: &str,
        operation: &str,
        amount: i64,
        feature: &str,
        context: &serde_json::Value,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO token_transactions
                 (id, user_id, operation, amount, feature, context, success, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(operation)
        .bind(amount)
        .bind(feature)
        .bind(context.to_string())
        .bind(success as i64)
        .bind(error_message)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
