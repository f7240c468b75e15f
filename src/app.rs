//! Subscription management and the `refresh` / `deliver` batch passes.
//!
//! [`App`] owns the store and both collaborators. Batch operations isolate
//! failures per item: one broken feed or one rejected mail is reported in
//! its own outcome and the pass moves on to the next item.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;

use crate::feed::{FeedSource, FetchError};
use crate::mail::{
    article_mail, digest_mail, validate_address, BodyFormat, MailError, MailTransport,
};
use crate::storage::{
    Article, Database, DatabaseError, Feed, FeedFilter, NewSubscription, Subscription,
    SubscriptionFilter, DEFAULT_DESC_LENGTH,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed user input
    #[error("{0}")]
    Validation(String),

    #[error("'{url}' is already being delivered to {email}")]
    DuplicateSubscription { url: String, email: String },

    /// The feed location could not be fetched or parsed; nothing was stored
    #[error("Unable to add an invalid feed location '{url}': {source}")]
    InvalidFeed {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("No {entity} exists with id {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Mail(#[from] MailError),
}

// ============================================================================
// Operation Types
// ============================================================================

/// Request to subscribe an address to a feed.
#[derive(Debug, Clone)]
pub struct AddSubscription {
    pub url: String,
    /// Overrides the title parsed from the feed
    pub title: Option<String>,
    pub email: Option<String>,
    pub digest: bool,
    /// 0 leaves descriptions out of mail
    pub desc_length: u32,
}

impl Default for AddSubscription {
    fn default() -> Self {
        Self {
            url: String::new(),
            title: None,
            email: None,
            digest: false,
            desc_length: DEFAULT_DESC_LENGTH,
        }
    }
}

/// Result of refreshing one feed during a refresh-all pass.
#[derive(Debug)]
pub struct FeedRefreshOutcome {
    pub feed: Feed,
    /// Number of new articles stored
    pub result: Result<usize, AppError>,
}

#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub outcomes: Vec<FeedRefreshOutcome>,
}

impl RefreshSummary {
    /// New articles across every feed that refreshed successfully.
    pub fn total_new(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }
}

/// What happened to one subscription id in a deliver pass.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// No subscription has this id
    NotFound,
    /// Nothing newer than the watermark; the watermark was left alone
    NothingToDeliver,
    /// Pretend mode: what would have been sent
    Pretended {
        subscription: Subscription,
        articles: Vec<Article>,
    },
    /// The watermark was advanced and every mail was handed to the transport
    Delivered { sent: usize, failed: usize },
    /// A store or transport error stopped this subscription
    Failed(AppError),
}

#[derive(Debug)]
pub struct SubscriptionDelivery {
    pub subscription_id: i64,
    pub outcome: DeliveryOutcome,
}

// ============================================================================
// App
// ============================================================================

pub struct App<F, M> {
    db: Database,
    source: F,
    mailer: Option<M>,
    format: BodyFormat,
}

impl<F: FeedSource, M: MailTransport> App<F, M> {
    /// `mailer` may be `None` when SMTP is not configured; only non-pretend
    /// delivery needs it.
    pub fn new(db: Database, source: F, mailer: Option<M>, format: BodyFormat) -> Self {
        Self {
            db,
            source,
            mailer,
            format,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Subscribe an address to a feed location.
    ///
    /// The location is fetched once to prove it parses and to pick a title
    /// (explicit title, else the feed's own title, else the url). Articles
    /// are not stored until the next refresh.
    ///
    /// # Errors
    ///
    /// - `Validation` if the email is missing or malformed
    /// - `DuplicateSubscription` if the address already receives this url
    /// - `InvalidFeed` if the location cannot be fetched or parsed; no feed
    ///   or subscription is created
    pub async fn add_subscription(&self, req: AddSubscription) -> Result<Subscription, AppError> {
        let email = req
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                AppError::Validation(
                    "An email must be provided either in the config file or with --email"
                        .to_string(),
                )
            })?;
        validate_address(email).map_err(|e| AppError::Validation(e.to_string()))?;

        let url = req.url.trim();
        if url.is_empty() {
            return Err(AppError::Validation("A feed url must be provided".to_string()));
        }

        let existing = self
            .db
            .find_subscriptions(&SubscriptionFilter {
                url: Some(url.to_string()),
                email: Some(email.to_string()),
                ..SubscriptionFilter::default()
            })
            .await?;
        if !existing.is_empty() {
            return Err(AppError::DuplicateSubscription {
                url: url.to_string(),
                email: email.to_string(),
            });
        }

        let fetched = self
            .source
            .fetch(url)
            .await
            .map_err(|source| AppError::InvalidFeed {
                url: url.to_string(),
                source,
            })?;

        let title = req
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or(fetched.title.filter(|t| !t.trim().is_empty()))
            .unwrap_or_else(|| url.to_string());

        let new = NewSubscription {
            title,
            url: url.to_string(),
            email: email.to_string(),
            digest: req.digest,
            desc_length: req.desc_length,
        };
        let subscription_id = match self.db.add_subscription(&new).await {
            Ok(id) => id,
            // Lost a race with another process adding the same pair
            Err(DatabaseError::Constraint(_)) => {
                return Err(AppError::DuplicateSubscription {
                    url: new.url,
                    email: new.email,
                })
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            subscription_id = subscription_id,
            url = %new.url,
            email = %new.email,
            "Subscription added"
        );

        self.db
            .find_subscription_by_id(subscription_id)
            .await?
            .ok_or(AppError::NotFound {
                entity: "subscription",
                id: subscription_id,
            })
    }

    pub async fn remove_subscription(&self, subscription_id: i64) -> Result<(), AppError> {
        if !self.db.remove_subscription(subscription_id).await? {
            return Err(AppError::NotFound {
                entity: "subscription",
                id: subscription_id,
            });
        }
        tracing::info!(subscription_id = subscription_id, "Subscription removed");
        Ok(())
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        Ok(self
            .db
            .find_subscriptions(&SubscriptionFilter::default())
            .await?)
    }

    /// Feeds with at least one subscription.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>, AppError> {
        Ok(self.db.find_feeds(&FeedFilter::default()).await?)
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    /// Fetch one feed and store the entries not seen before.
    ///
    /// Returns the number of new articles.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<usize, AppError> {
        let feed = self
            .db
            .find_feed_by_id(feed_id)
            .await?
            .ok_or(AppError::NotFound {
                entity: "feed",
                id: feed_id,
            })?;
        self.refresh_one(&feed).await
    }

    /// Refresh every subscribed feed in id order.
    ///
    /// A failing feed is recorded in its outcome and does not stop the pass.
    pub async fn refresh_all(&self) -> Result<RefreshSummary, AppError> {
        let feeds = self.list_feeds().await?;

        let outcomes = stream::iter(feeds)
            .then(|feed| async move {
                let result = self.refresh_one(&feed).await;
                if let Err(e) = &result {
                    tracing::warn!(feed_id = feed.feed_id, url = %feed.url, error = %e, "Feed refresh failed");
                }
                FeedRefreshOutcome { feed, result }
            })
            .collect::<Vec<_>>()
            .await;

        let summary = RefreshSummary { outcomes };
        tracing::info!(
            feeds = summary.outcomes.len(),
            failed = summary.failed(),
            new_articles = summary.total_new(),
            "{} new articles found in total",
            summary.total_new()
        );
        Ok(summary)
    }

    async fn refresh_one(&self, feed: &Feed) -> Result<usize, AppError> {
        let fetched = self.source.fetch(&feed.url).await?;
        let added = self
            .db
            .refresh_articles(feed.feed_id, &fetched.articles)
            .await?;

        if added > 0 {
            tracing::info!(feed_id = feed.feed_id, title = %feed.title, new_articles = added, "Found new articles");
        } else {
            tracing::info!(feed_id = feed.feed_id, title = %feed.title, "No new articles found");
        }
        Ok(added)
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Deliver due articles for each subscription id, in the order given.
    ///
    /// The watermark is advanced *before* mail is handed to the transport,
    /// and a failed send does not move it back: a subscription gets each
    /// article at most once, and a transport failure skips it. The watermark
    /// time is read before the selection, so only an article stamped by an
    /// overlapping refresh and committed after the selection can be missed.
    ///
    /// With `pretend`, articles are selected and returned but the watermark
    /// is untouched and nothing is sent.
    ///
    /// # Errors
    ///
    /// `Mail(MailError::NotConfigured)` when not pretending and no transport
    /// was configured. Nothing is changed in that case. All other failures
    /// are reported per subscription.
    pub async fn deliver(
        &self,
        subscription_ids: &[i64],
        pretend: bool,
    ) -> Result<Vec<SubscriptionDelivery>, AppError> {
        if !pretend && self.mailer.is_none() {
            return Err(MailError::NotConfigured.into());
        }

        let mut results = Vec::with_capacity(subscription_ids.len());
        for &subscription_id in subscription_ids {
            let outcome = match self.deliver_one(subscription_id, pretend).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(subscription_id = subscription_id, error = %e, "Delivery failed");
                    DeliveryOutcome::Failed(e)
                }
            };
            results.push(SubscriptionDelivery {
                subscription_id,
                outcome,
            });
        }
        Ok(results)
    }

    async fn deliver_one(
        &self,
        subscription_id: i64,
        pretend: bool,
    ) -> Result<DeliveryOutcome, AppError> {
        let Some(subscription) = self.db.find_subscription_by_id(subscription_id).await? else {
            tracing::error!(subscription_id = subscription_id, "No subscription exists with that id");
            return Ok(DeliveryOutcome::NotFound);
        };

        // Taken before the select so undated articles stamped by a concurrent
        // refresh after this point stay due. One stamped earlier but committed
        // after the select is skipped unsent.
        let now = Utc::now();
        let articles = self.db.find_articles_for_delivery(subscription_id).await?;
        if articles.is_empty() {
            tracing::info!(
                subscription_id = subscription_id,
                since = %subscription.watermark(),
                "No articles to deliver"
            );
            return Ok(DeliveryOutcome::NothingToDeliver);
        }

        if pretend {
            return Ok(DeliveryOutcome::Pretended {
                subscription,
                articles,
            });
        }

        let Some(mailer) = &self.mailer else {
            return Err(MailError::NotConfigured.into());
        };

        self.db
            .set_attempted_delivery_at(subscription_id, now)
            .await?;

        let mails = if subscription.digest {
            vec![digest_mail(&subscription, &articles, self.format)]
        } else {
            articles
                .iter()
                .map(|article| article_mail(&subscription, article, self.format))
                .collect()
        };

        let (mut sent, mut failed) = (0, 0);
        for mail in &mails {
            match mailer.send(mail).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        subscription_id = subscription_id,
                        to = %mail.to,
                        subject = %mail.subject,
                        error = %e,
                        "Mail not sent"
                    );
                }
            }
        }

        tracing::info!(
            subscription_id = subscription_id,
            articles = articles.len(),
            digest = subscription.digest,
            sent = sent,
            failed = failed,
            "Delivery attempted"
        );
        Ok(DeliveryOutcome::Delivered { sent, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn feed(id: i64) -> Feed {
        Feed {
            feed_id: id,
            title: format!("Feed {}", id),
            url: format!("https://f{}.example/rss", id),
            created_at: Utc::now(),
            updated_at: None,
            refreshed_at: None,
        }
    }

    #[test]
    fn test_refresh_summary_totals_skip_failures() {
        let summary = RefreshSummary {
            outcomes: vec![
                FeedRefreshOutcome {
                    feed: feed(1),
                    result: Ok(3),
                },
                FeedRefreshOutcome {
                    feed: feed(2),
                    result: Err(AppError::Fetch(FetchError::HttpStatus(500))),
                },
                FeedRefreshOutcome {
                    feed: feed(3),
                    result: Ok(0),
                },
            ],
        };
        assert_eq!(summary.total_new(), 3);
        assert_eq!(summary.failed(), 1);
    }

    #[test]
    fn test_add_request_defaults_to_stored_desc_length() {
        let req = AddSubscription::default();
        assert_eq!(req.desc_length, DEFAULT_DESC_LENGTH);
        assert!(!req.digest);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RefreshSummary::default();
        assert_eq!(summary.total_new(), 0);
        assert_eq!(summary.failed(), 0);
    }

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = AppError::NotFound {
            entity: "subscription",
            id: 42,
        };
        assert_eq!(err.to_string(), "No subscription exists with id 42");

        let err = AppError::DuplicateSubscription {
            url: "https://a.example/rss".into(),
            email: "a@example.com".into(),
        };
        assert!(err.to_string().contains("https://a.example/rss"));
        assert!(err.to_string().contains("a@example.com"));

        let err = AppError::InvalidFeed {
            url: "https://bad.example".into(),
            source: FetchError::HttpStatus(404),
        };
        assert!(err.to_string().contains("https://bad.example"));
    }
}
