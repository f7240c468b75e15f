//! Small text and URL helpers shared by the feed and mail collaborators.

mod text;
mod url_validator;

pub use text::{single_line, truncate_chars};
pub use url_validator::{validate_feed_url, FeedUrlError};
