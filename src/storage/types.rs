use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store errors with user-friendly messages.
///
/// Every store operation runs inside its own transaction, so any of these
/// means the call left no partial state behind.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process is holding the write lock past the busy timeout
    #[error("Database is busy: another feedmailer process may be writing to it. Try again shortly.")]
    Busy,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A row the operation depends on does not exist
    #[error("No {entity} exists with id {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// A uniqueness or foreign key constraint rejected the write
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error into lock, constraint, or generic failures.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                return DatabaseError::Constraint(db_err.message().to_string());
            }
        }

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Busy;
        }

        DatabaseError::Other(err)
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::from_sqlx(err)
    }
}

// ============================================================================
// Timestamp Encoding
// ============================================================================

/// Timestamps are stored as INTEGER Unix milliseconds in UTC.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

// ============================================================================
// Input Types
// ============================================================================

/// A freshly fetched entry, before reconciliation against stored articles.
///
/// `published_at` may carry any offset; it is normalized to UTC when merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewArticle {
    pub url: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<FixedOffset>>,
}

impl NewArticle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Parameters for [`Database::add_subscription`](super::Database::add_subscription).
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    /// Title used only when the feed does not exist yet
    pub title: String,
    pub url: String,
    pub email: String,
    pub digest: bool,
    pub desc_length: u32,
}

/// Filter for feed listings. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub feed_id: Option<i64>,
    pub title: Option<String>,
    pub url: Option<String>,
}

/// Filter for subscription listings. Title and url apply to the owning feed.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub subscription_id: Option<i64>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub email: Option<String>,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub refreshed_at: Option<i64>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            feed_id: self.feed_id,
            title: self.title,
            url: self.url,
            created_at: from_millis(self.created_at),
            updated_at: self.updated_at.map(from_millis),
            refreshed_at: self.refreshed_at.map(from_millis),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionDbRow {
    pub subscription_id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub email: String,
    pub digest: bool,
    pub desc_length: i64,
    pub attempted_delivery_at: Option<i64>,
    pub refreshed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl SubscriptionDbRow {
    pub(crate) fn into_subscription(self) -> Subscription {
        Subscription {
            subscription_id: self.subscription_id,
            feed_id: self.feed_id,
            title: self.title,
            url: self.url,
            email: self.email,
            digest: self.digest,
            desc_length: u32::try_from(self.desc_length).unwrap_or(DEFAULT_DESC_LENGTH),
            attempted_delivery_at: self.attempted_delivery_at.map(from_millis),
            refreshed_at: self.refreshed_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: self.updated_at.map(from_millis),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub article_id: i64,
    pub feed_id: i64,
    pub title: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            article_id: self.article_id,
            feed_id: self.feed_id,
            title: self.title,
            url: self.url,
            author: self.author,
            description: self.description,
            category: self.category,
            published_at: self.published_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: self.updated_at.map(from_millis),
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Default maximum description length used when rendering mail.
pub const DEFAULT_DESC_LENGTH: u32 = 300;

/// A subscribable source, unique by `url`.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Set on every successful reconciliation pass, even one that found nothing
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// A (feed, recipient) pairing joined with its owning feed's title and url.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub subscription_id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub email: String,
    pub digest: bool,
    pub desc_length: u32,
    /// Delivery watermark
    pub attempted_delivery_at: Option<DateTime<Utc>>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// The cutoff articles must be newer than to be due for delivery.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.attempted_delivery_at.unwrap_or(self.created_at)
    }
}

/// A stored article. Never updated after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub article_id: i64,
    pub feed_id: i64,
    pub title: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}
