use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{
    to_millis, DatabaseError, NewSubscription, Subscription, SubscriptionDbRow,
    SubscriptionFilter,
};

impl Database {
    // ========================================================================
    // Subscription Operations
    // ========================================================================

    /// List subscriptions joined with their feed. `title`/`url` filter the feed.
    pub async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let rows = sqlx::query_as::<_, SubscriptionDbRow>(
            r#"
            SELECT s.subscription_id, f.feed_id, f.title, f.url, s.email, s.digest,
                   s.desc_length, s.attempted_delivery_at, f.refreshed_at,
                   s.created_at, s.updated_at
            FROM subscriptions s
            INNER JOIN feeds f ON s.feed_id = f.feed_id
            WHERE s.subscription_id = COALESCE(?, s.subscription_id)
              AND f.title = COALESCE(?, f.title)
              AND f.url = COALESCE(?, f.url)
              AND s.email = COALESCE(?, s.email)
            ORDER BY s.subscription_id
        "#,
        )
        .bind(filter.subscription_id)
        .bind(filter.title.as_deref())
        .bind(filter.url.as_deref())
        .bind(filter.email.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(SubscriptionDbRow::into_subscription)
            .collect())
    }

    pub async fn find_subscription_by_id(
        &self,
        subscription_id: i64,
    ) -> Result<Option<Subscription>, DatabaseError> {
        let mut found = self
            .find_subscriptions(&SubscriptionFilter {
                subscription_id: Some(subscription_id),
                ..SubscriptionFilter::default()
            })
            .await?;
        Ok(found.pop())
    }

    /// Subscribe `email` to the feed at `url`, creating the feed if needed.
    ///
    /// The feed insert is conditioned on absence (`ON CONFLICT(url) DO NOTHING`)
    /// rather than on a prior read, so two processes adding the same new url
    /// resolve to a single feed row. An existing feed keeps its title.
    ///
    /// # Returns
    ///
    /// The new subscription id.
    ///
    /// # Errors
    ///
    /// `DatabaseError::Constraint` if `email` already subscribes to the feed.
    pub async fn add_subscription(&self, new: &NewSubscription) -> Result<i64, DatabaseError> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO feeds (title, url, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(url) DO NOTHING
        "#,
        )
        .bind(&new.title)
        .bind(&new.url)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (feed_id,): (i64,) = sqlx::query_as("SELECT feed_id FROM feeds WHERE url = ?")
            .bind(&new.url)
            .fetch_one(&mut *tx)
            .await?;

        let (subscription_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (feed_id, email, digest, desc_length, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING subscription_id
        "#,
        )
        .bind(feed_id)
        .bind(&new.email)
        .bind(new.digest)
        .bind(i64::from(new.desc_length))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            subscription_id = subscription_id,
            feed_id = feed_id,
            email = %new.email,
            "Subscription added"
        );
        Ok(subscription_id)
    }

    /// Delete a subscription. Its feed and articles are left in place.
    ///
    /// Returns `false` if no subscription had that id.
    pub async fn remove_subscription(&self, subscription_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE subscription_id = ?")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move the delivery watermark of a subscription to `at`.
    ///
    /// Callers advance the watermark *before* handing articles to the mail
    /// transport: a crash between the two skips those articles on the next
    /// run instead of sending them twice.
    ///
    /// Returns `false` if no subscription had that id.
    pub async fn set_attempted_delivery_at(
        &self,
        subscription_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let at = to_millis(at);
        let result = sqlx::query(
            "UPDATE subscriptions SET attempted_delivery_at = ?, updated_at = ? WHERE subscription_id = ?",
        )
        .bind(at)
        .bind(at)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
