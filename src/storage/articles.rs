use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{to_millis, Article, ArticleDbRow, DatabaseError, NewArticle};

/// Rows per staging INSERT. 7 bound columns * 50 stays well under SQLite's 999 limit.
const BATCH_SIZE: usize = 50;

impl Database {
    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Merge freshly fetched candidates into a feed's articles.
    ///
    /// Equivalent to [`refresh_articles_at`](Self::refresh_articles_at) with
    /// the current time.
    pub async fn refresh_articles(
        &self,
        feed_id: i64,
        candidates: &[NewArticle],
    ) -> Result<usize, DatabaseError> {
        self.refresh_articles_at(feed_id, candidates, Utc::now())
            .await
    }

    /// Merge freshly fetched candidates into a feed's articles as of `now`.
    ///
    /// Runs as one transaction:
    ///
    /// 1. stamp the feed's `refreshed_at`/`updated_at`, even for an empty batch
    /// 2. stage the candidates in a per-connection temp table keyed by url
    ///    (the first candidate wins when a batch repeats a url)
    /// 3. insert the staged rows with no `(feed_id, url)` match in `articles`
    ///
    /// Existing articles are never touched, so a republished url keeps its
    /// original title and description. Published dates are normalized to UTC.
    ///
    /// # Returns
    ///
    /// The number of articles actually inserted.
    ///
    /// # Errors
    ///
    /// `DatabaseError::NotFound` if the feed does not exist; nothing is written.
    pub async fn refresh_articles_at(
        &self,
        feed_id: i64,
        candidates: &[NewArticle],
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let now = to_millis(now);
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock from the start
        let marked = sqlx::query(
            "UPDATE feeds SET refreshed_at = ?, updated_at = ? WHERE feed_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "feed",
                id: feed_id,
            });
        }

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        sqlx::query(
            r#"
            CREATE TEMP TABLE IF NOT EXISTS staged_articles (
                position INTEGER NOT NULL,
                url TEXT PRIMARY KEY NOT NULL,
                title TEXT,
                author TEXT,
                description TEXT,
                category TEXT,
                published_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM staged_articles")
            .execute(&mut *tx)
            .await?;

        let staged: Vec<(usize, &NewArticle)> = candidates.iter().enumerate().collect();
        for chunk in staged.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO staged_articles (position, url, title, author, description, category, published_at) ",
            );

            builder.push_values(chunk, |mut b, (position, article)| {
                b.push_bind(*position as i64)
                    .push_bind(&article.url)
                    .push_bind(&article.title)
                    .push_bind(&article.author)
                    .push_bind(&article.description)
                    .push_bind(&article.category)
                    .push_bind(
                        article
                            .published_at
                            .map(|at| to_millis(at.with_timezone(&Utc))),
                    );
            });

            builder.build().execute(&mut *tx).await?;
        }

        // Set difference against stored keys: only unseen urls for this feed
        let inserted = sqlx::query(
            r#"
            INSERT INTO articles (feed_id, url, title, author, description, category,
                                  published_at, created_at, updated_at)
            SELECT ?, s.url, s.title, s.author, s.description, s.category,
                   s.published_at, ?, ?
            FROM staged_articles s
            LEFT JOIN articles a ON a.feed_id = ? AND a.url = s.url
            WHERE a.article_id IS NULL
            ORDER BY s.position
        "#,
        )
        .bind(feed_id)
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM staged_articles")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            feed_id = feed_id,
            candidates = candidates.len(),
            inserted = inserted,
            "Articles reconciled"
        );
        Ok(inserted as usize)
    }

    // ========================================================================
    // Delivery Selection
    // ========================================================================

    /// Articles of the subscription's feed newer than its watermark.
    ///
    /// An article qualifies when `COALESCE(published_at, created_at)` is
    /// strictly greater than `COALESCE(attempted_delivery_at, created_at)` of
    /// the subscription. Results are ordered oldest first by that same
    /// timestamp, ties broken by insertion order.
    ///
    /// An unknown subscription id or an empty feed yields an empty list.
    pub async fn find_articles_for_delivery(
        &self,
        subscription_id: i64,
    ) -> Result<Vec<Article>, DatabaseError> {
        let rows = sqlx::query_as::<_, ArticleDbRow>(
            r#"
            SELECT a.article_id, a.feed_id, a.title, a.url, a.author, a.description,
                   a.category, a.published_at, a.created_at, a.updated_at
            FROM subscriptions s
            INNER JOIN articles a ON s.feed_id = a.feed_id
            WHERE s.subscription_id = ?
              AND COALESCE(a.published_at, a.created_at) > COALESCE(s.attempted_delivery_at, s.created_at)
            ORDER BY COALESCE(a.published_at, a.created_at) ASC, a.article_id ASC
        "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// All stored articles of a feed in insertion order.
    pub async fn get_articles_for_feed(&self, feed_id: i64) -> Result<Vec<Article>, DatabaseError> {
        let rows = sqlx::query_as::<_, ArticleDbRow>(
            r#"
            SELECT article_id, feed_id, title, url, author, description, category,
                   published_at, created_at, updated_at
            FROM articles
            WHERE feed_id = ?
            ORDER BY article_id
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    pub async fn count_articles(&self, feed_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, DatabaseError, NewArticle, NewSubscription};
    use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    /// Returns (feed_id, subscription_id)
    async fn seed(db: &Database, url: &str, email: &str) -> (i64, i64) {
        let sub_id = db
            .add_subscription(&NewSubscription {
                title: "Seeded".into(),
                url: url.into(),
                email: email.into(),
                digest: false,
                desc_length: 300,
            })
            .await
            .unwrap();
        let sub = db.find_subscription_by_id(sub_id).await.unwrap().unwrap();
        (sub.feed_id, sub_id)
    }

    fn article(url: &str, title: &str, published: Option<DateTime<Utc>>) -> NewArticle {
        NewArticle {
            url: url.to_string(),
            title: Some(title.to_string()),
            author: None,
            description: Some(format!("About {}", title)),
            category: None,
            published_at: published.map(|p| p.fixed_offset()),
        }
    }

    #[tokio::test]
    async fn test_refresh_inserts_then_dedups() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;
        let candidates = vec![article("a/1", "A", None)];

        assert_eq!(db.refresh_articles(feed_id, &candidates).await.unwrap(), 1);
        assert_eq!(db.refresh_articles(feed_id, &candidates).await.unwrap(), 0);
        assert_eq!(db.count_articles(feed_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_keeps_original_copy_of_republished_url() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;

        db.refresh_articles(feed_id, &[article("a/1", "Original", None)])
            .await
            .unwrap();
        let before = db.get_articles_for_feed(feed_id).await.unwrap();

        let count = db
            .refresh_articles(
                feed_id,
                &[article("a/1", "Edited", None), article("a/2", "Second", None)],
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        let after = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], before[0]);
        assert_eq!(after[1].title.as_deref(), Some("Second"));
    }

    #[tokio::test]
    async fn test_refresh_collapses_repeated_url_in_batch() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;

        let count = db
            .refresh_articles(
                feed_id,
                &[article("a/1", "First", None), article("a/1", "Again", None)],
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        let stored = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(stored[0].title.as_deref(), Some("First"));
    }

    #[tokio::test]
    async fn test_refresh_same_url_across_feeds() {
        let db = test_db().await;
        let (feed_a, _) = seed(&db, "https://a.example/rss", "a@example.com").await;
        let (feed_b, _) = seed(&db, "https://b.example/rss", "a@example.com").await;
        let shared = vec![article("https://shared.example/post", "Shared", None)];

        assert_eq!(db.refresh_articles(feed_a, &shared).await.unwrap(), 1);
        assert_eq!(db.refresh_articles(feed_b, &shared).await.unwrap(), 1);
        assert_eq!(db.count_articles(feed_a).await.unwrap(), 1);
        assert_eq!(db.count_articles(feed_b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_accepts_missing_title_and_description() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;

        let count = db
            .refresh_articles(feed_id, &[NewArticle::new("bare/1")])
            .await
            .unwrap();
        assert_eq!(count, 1);

        let stored = db.get_articles_for_feed(feed_id).await.unwrap();
        assert!(stored[0].title.is_none());
        assert!(stored[0].description.is_none());
        assert!(stored[0].published_at.is_none());
    }

    #[tokio::test]
    async fn test_refresh_marks_feed_even_when_empty() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(db.refresh_articles_at(feed_id, &[], now).await.unwrap(), 0);

        let feed = db.find_feed_by_id(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.refreshed_at, Some(now));
        assert_eq!(feed.updated_at, Some(now));
    }

    #[tokio::test]
    async fn test_refresh_unknown_feed_writes_nothing() {
        let db = test_db().await;
        let err = db
            .refresh_articles(77, &[article("a/1", "A", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { id: 77, .. }));
        assert_eq!(db.count_articles(77).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_normalizes_published_to_utc() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = plus_two.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap();
        let candidate = NewArticle {
            published_at: Some(local),
            ..NewArticle::new("tz/1")
        };
        db.refresh_articles(feed_id, &[candidate]).await.unwrap();

        let stored = db.get_articles_for_feed(feed_id).await.unwrap();
        assert_eq!(
            stored[0].published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_refresh_large_batch_spans_chunks() {
        let db = test_db().await;
        let (feed_id, _) = seed(&db, "https://f.example/rss", "a@example.com").await;

        let candidates: Vec<NewArticle> = (0..175)
            .map(|i| article(&format!("bulk/{}", i), &format!("Bulk {}", i), None))
            .collect();
        assert_eq!(db.refresh_articles(feed_id, &candidates).await.unwrap(), 175);
        assert_eq!(db.refresh_articles(feed_id, &candidates).await.unwrap(), 0);
        assert_eq!(db.count_articles(feed_id).await.unwrap(), 175);
    }

    #[tokio::test]
    async fn test_delivery_selects_articles_after_subscription() {
        let db = test_db().await;
        let (feed_id, sub_id) = seed(&db, "https://f.example/rss", "a@example.com").await;
        let sub = db.find_subscription_by_id(sub_id).await.unwrap().unwrap();

        let old = sub.created_at - Duration::days(2);
        let later = sub.created_at + Duration::hours(2);
        let latest = sub.created_at + Duration::hours(4);
        db.refresh_articles(
            feed_id,
            &[
                article("new/2", "Latest", Some(latest)),
                article("old/1", "Old", Some(old)),
                article("new/1", "Later", Some(later)),
            ],
        )
        .await
        .unwrap();

        let due = db.find_articles_for_delivery(sub_id).await.unwrap();
        let titles: Vec<_> = due.iter().filter_map(|a| a.title.as_deref()).collect();
        assert_eq!(titles, vec!["Later", "Latest"]);
    }

    #[tokio::test]
    async fn test_delivery_uses_created_at_when_unpublished() {
        let db = test_db().await;
        let (feed_id, sub_id) = seed(&db, "https://f.example/rss", "a@example.com").await;
        let sub = db.find_subscription_by_id(sub_id).await.unwrap().unwrap();

        db.refresh_articles_at(
            feed_id,
            &[NewArticle::new("undated/1")],
            sub.created_at + Duration::seconds(1),
        )
        .await
        .unwrap();
        db.refresh_articles_at(
            feed_id,
            &[NewArticle::new("undated/0")],
            sub.created_at - Duration::seconds(1),
        )
        .await
        .unwrap();

        let due = db.find_articles_for_delivery(sub_id).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].url, "undated/1");
    }

    #[tokio::test]
    async fn test_delivery_respects_watermark() {
        let db = test_db().await;
        let (feed_id, sub_id) = seed(&db, "https://f.example/rss", "a@example.com").await;
        let sub = db.find_subscription_by_id(sub_id).await.unwrap().unwrap();

        let first = sub.created_at + Duration::hours(1);
        let second = sub.created_at + Duration::hours(3);
        db.refresh_articles(
            feed_id,
            &[
                article("w/1", "First", Some(first)),
                article("w/2", "Second", Some(second)),
            ],
        )
        .await
        .unwrap();

        db.set_attempted_delivery_at(sub_id, sub.created_at + Duration::hours(2))
            .await
            .unwrap();
        let due = db.find_articles_for_delivery(sub_id).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].url, "w/2");

        // Watermark exactly on an article's timestamp excludes it
        db.set_attempted_delivery_at(sub_id, second).await.unwrap();
        assert!(db.find_articles_for_delivery(sub_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_empty_feed_and_unknown_subscription() {
        let db = test_db().await;
        let (_, sub_id) = seed(&db, "https://f.example/rss", "a@example.com").await;

        assert!(db.find_articles_for_delivery(sub_id).await.unwrap().is_empty());
        assert!(db.find_articles_for_delivery(9999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_is_scoped_to_the_subscriptions_feed() {
        let db = test_db().await;
        let (feed_a, sub_a) = seed(&db, "https://a.example/rss", "a@example.com").await;
        let (_, sub_b) = seed(&db, "https://b.example/rss", "a@example.com").await;
        let sub = db.find_subscription_by_id(sub_a).await.unwrap().unwrap();

        db.refresh_articles(
            feed_a,
            &[article("a/1", "Only A", Some(sub.created_at + Duration::hours(1)))],
        )
        .await
        .unwrap();

        assert_eq!(db.find_articles_for_delivery(sub_a).await.unwrap().len(), 1);
        assert!(db.find_articles_for_delivery(sub_b).await.unwrap().is_empty());
    }
}
