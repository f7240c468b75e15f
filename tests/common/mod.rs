//! Recording fakes for the feed and mail collaborators.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset};
use feedmailer::app::App;
use feedmailer::feed::{FeedSource, FetchError, FetchedFeed};
use feedmailer::mail::{BodyFormat, MailError, MailTransport, OutgoingMail};
use feedmailer::storage::{Database, NewArticle};

/// Serves canned feeds by url. Unknown urls answer 404.
#[derive(Clone, Default)]
pub struct FakeFeedSource {
    feeds: Arc<Mutex<HashMap<String, FetchedFeed>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeFeedSource {
    pub fn serve(&self, url: &str, title: Option<&str>, articles: Vec<NewArticle>) {
        self.feeds.lock().unwrap().insert(
            url.to_string(),
            FetchedFeed {
                title: title.map(str::to_string),
                articles,
                skipped: 0,
            },
        );
    }

    pub fn remove(&self, url: &str) {
        self.feeds.lock().unwrap().remove(url);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl FeedSource for FakeFeedSource {
    async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(FetchError::HttpStatus(404))
    }
}

/// Records every mail handed to it. Recipients in `reject` fail.
#[derive(Clone, Default)]
pub struct FakeMailer {
    sent: Arc<Mutex<Vec<OutgoingMail>>>,
    reject: Arc<Mutex<HashSet<String>>>,
}

impl FakeMailer {
    pub fn reject(&self, address: &str) {
        self.reject.lock().unwrap().insert(address.to_string());
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailTransport for FakeMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        if self.reject.lock().unwrap().contains(&mail.to) {
            return Err(MailError::InvalidAddress {
                address: mail.to.clone(),
                reason: "rejected by test relay".to_string(),
            });
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

pub struct Harness {
    pub app: App<FakeFeedSource, FakeMailer>,
    pub source: FakeFeedSource,
    pub mailer: FakeMailer,
}

pub async fn harness() -> Harness {
    let db = Database::open(":memory:").await.unwrap();
    let source = FakeFeedSource::default();
    let mailer = FakeMailer::default();
    let app = App::new(db, source.clone(), Some(mailer.clone()), BodyFormat::Plain);
    Harness {
        app,
        source,
        mailer,
    }
}

pub fn article(url: &str, title: &str, published: Option<&str>) -> NewArticle {
    NewArticle {
        title: Some(title.to_string()),
        description: Some(format!("About {}", title)),
        published_at: published.map(date),
        ..NewArticle::new(url)
    }
}

pub fn date(rfc3339: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap()
}
