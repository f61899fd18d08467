//! Subscription activation and quota reset
//!
//! Activation and quota mutation run inside the caller's transaction so
//! the single-active-subscription invariant holds atomically with the
//! payment transition that triggered it.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use finflow_shared::Plan;

use crate::error::BillingResult;

/// Calendar month addition with end-of-month day clamping.
pub fn add_months(dt: OffsetDateTime, months: i32) -> OffsetDateTime {
    let date = dt.date();
    let total = date.year() * 12 + (date.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;
    let month = match time::Month::try_from(month_index) {
        Ok(m) => m,
        Err(_) => return dt + time::Duration::days(30 * months as i64),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match time::Date::from_calendar_date(year, month, day) {
        Ok(d) => dt.replace_date(d),
        Err(_) => dt + time::Duration::days(30 * months as i64),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub auto_renew: bool,
}

/// A subscription the auto-renewal sweep should act on.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RenewableSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub ends_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as("SELECT * FROM plans WHERE id = $1 AND active = TRUE")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    pub async fn find(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let sub = sqlx::query_as(
            "SELECT id, user_id, plan_id, status, starts_at, ends_at, auto_renew
             FROM subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    /// Activate a subscription for the user inside the caller's
    /// transaction, demoting any currently-active one to `expired` in the
    /// same atomic scope. Returns the new subscription id.
    pub async fn activate_in_txn(
        txn: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        plan: &Plan,
        auto_renew: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Uuid> {
        let demoted = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE user_id = $1 AND status = 'active'
            "#,
        )
        .bind(user_id)
        .execute(&mut **txn)
        .await?;

        if demoted.rows_affected() > 0 {
            tracing::info!(
                user_id = %user_id,
                demoted = demoted.rows_affected(),
                "Demoted previously active subscription"
            );
        }

        let ends_at = add_months(now, plan.period_months);
        let (sub_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (user_id, plan_id, status, starts_at, ends_at, auto_renew)
            VALUES ($1, $2, 'active', $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(plan.id)
        .bind(now)
        .bind(ends_at)
        .bind(auto_renew)
        .fetch_one(&mut **txn)
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub_id,
            plan = %plan.name,
            ends_at = %ends_at,
            "Subscription activated"
        );
        Ok(sub_id)
    }

    /// Reset the user's usage counters for the new billing period inside
    /// the caller's transaction. The counter schema is owned outside this
    /// core; this is its single touch point.
    pub async fn reset_quota_in_txn(
        txn: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_quotas (user_id, plan_id, requests_used, period_started_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                requests_used = 0,
                period_started_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }

    /// Active auto-renew subscriptions whose end date falls inside the
    /// given day window from now.
    pub async fn renewable_within(
        &self,
        from_days: i64,
        to_days: i64,
    ) -> BillingResult<Vec<RenewableSubscription>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_id, ends_at
            FROM subscriptions
            WHERE status = 'active'
              AND auto_renew = TRUE
              AND ends_at >= NOW() + ($1 || ' days')::INTERVAL
              AND ends_at < NOW() + ($2 || ' days')::INTERVAL
            "#,
        )
        .bind(from_days.to_string())
        .bind(to_days.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn add_months_advances_calendar_month() {
        let start = datetime!(2025-03-15 10:00 UTC);
        assert_eq!(add_months(start, 1), datetime!(2025-04-15 10:00 UTC));
        assert_eq!(add_months(start, 12), datetime!(2026-03-15 10:00 UTC));
    }

    #[test]
    fn add_months_clamps_end_of_month() {
        let start = datetime!(2025-01-31 00:00 UTC);
        assert_eq!(add_months(start, 1), datetime!(2025-02-28 00:00 UTC));
        let leap = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(add_months(leap, 1), datetime!(2024-02-29 00:00 UTC));
    }

    #[test]
    fn add_months_crosses_year_boundary() {
        let start = datetime!(2025-11-30 00:00 UTC);
        assert_eq!(add_months(start, 3), datetime!(2026-02-28 00:00 UTC));
    }
}
