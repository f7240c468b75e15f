//! Feed fetching and parsing.
//!
//! - [`parser`] - converts RSS/Atom bytes into [`NewArticle`](crate::storage::NewArticle)
//!   candidates using `feed-rs`, with HTML stripped by `html2text`
//! - [`source`] - the [`FeedSource`] seam and its HTTP implementation
//!
//! Nothing here touches the database; callers hand the fetched candidates
//! to [`Database::refresh_articles`](crate::storage::Database::refresh_articles).

mod parser;
mod source;

pub use parser::{html_to_text, parse_feed, FetchedFeed};
pub use source::{FeedSource, FetchError, HttpFeedSource};
