use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use html2text::render::TrivialDecorator;

use crate::storage::NewArticle;
use crate::util::single_line;

/// Wrap width for descriptions converted from HTML
const TEXT_WIDTH: usize = 80;

/// Outcome of parsing one feed document.
#[derive(Debug, Clone, Default)]
pub struct FetchedFeed {
    /// Channel title, if the document has one
    pub title: Option<String>,
    pub articles: Vec<NewArticle>,
    /// Entries dropped because they carry no link to dedup on
    pub skipped: usize,
}

/// Parse RSS/Atom/JSON Feed bytes into reconciliation candidates.
pub fn parse_feed(bytes: &[u8]) -> Result<FetchedFeed, parser::ParseFeedError> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| html_to_text(&t.content))
        .map(|t| single_line(&t).into_owned())
        .filter(|t| !t.is_empty());

    let mut skipped = 0;
    let articles = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let article = entry_to_article(entry);
            if article.is_none() {
                skipped += 1;
            }
            article
        })
        .collect();

    Ok(FetchedFeed {
        title,
        articles,
        skipped,
    })
}

fn entry_to_article(entry: Entry) -> Option<NewArticle> {
    let url = article_link(&entry.links)?;

    let title = entry
        .title
        .map(|t| single_line(&html_to_text(&t.content)).into_owned())
        .filter(|t| !t.is_empty());

    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .map(|html| html_to_text(&html))
        .filter(|d| !d.is_empty());

    let author = entry
        .authors
        .first()
        .map(|a| a.name.trim().to_string())
        .filter(|name| !name.is_empty());

    let category = entry
        .categories
        .first()
        .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
        .filter(|c| !c.is_empty());

    // feed-rs yields UTC already; unparseable dates arrive as None, never "now".
    // Atom entries without <published> fall back to <updated>.
    let published_at = entry.published.or(entry.updated).map(|dt| dt.fixed_offset());

    Some(NewArticle {
        url,
        title,
        author,
        description,
        category,
        published_at,
    })
}

/// The entry's own page: the first `alternate` (or untyped) link, else the
/// first link of any kind. The url is the dedup key, and `license` or
/// `replies` links may be shared between entries.
fn article_link(links: &[Link]) -> Option<String> {
    let is_alternate = |l: &&Link| l.rel.as_deref().map_or(true, |rel| rel == "alternate");
    links
        .iter()
        .find(is_alternate)
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

/// Strip markup from feed-supplied HTML, keeping readable text.
///
/// Links keep their text only; no `[1]` markers or footnote lists.
pub fn html_to_text(html: &str) -> String {
    let decorator = TrivialDecorator::new();
    match html2text::from_read_with_decorator(html.as_bytes(), TEXT_WIDTH, decorator) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "HTML conversion failed, keeping raw text");
            html.trim().to_string()
        }
    }
}
