use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedDbRow, FeedFilter};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// List feeds matching every provided filter field.
    ///
    /// Only feeds with at least one subscription are returned; a feed whose
    /// subscriptions were all removed stays in the table but drops out of
    /// listings and of `refresh` without an id.
    pub async fn find_feeds(&self, filter: &FeedFilter) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT DISTINCT f.feed_id, f.title, f.url, f.created_at, f.updated_at, f.refreshed_at
            FROM feeds f
            INNER JOIN subscriptions s ON f.feed_id = s.feed_id
            WHERE f.feed_id = COALESCE(?, f.feed_id)
              AND f.title = COALESCE(?, f.title)
              AND f.url = COALESCE(?, f.url)
            ORDER BY f.feed_id
        "#,
        )
        .bind(filter.feed_id)
        .bind(filter.title.as_deref())
        .bind(filter.url.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Look up a feed by id, whether or not anything subscribes to it.
    pub async fn find_feed_by_id(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT feed_id, title, url, created_at, updated_at, refreshed_at
            FROM feeds
            WHERE feed_id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    /// Look up a feed by its unique url.
    pub async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT feed_id, title, url, created_at, updated_at, refreshed_at
            FROM feeds
            WHERE url = ?
        "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }
}
