//! Plain-text and HTML bodies for single-article mails and digests.

use std::fmt::Write;

use super::{BodyFormat, OutgoingMail};
use crate::storage::{Article, Subscription};
use crate::util::{single_line, truncate_chars};

/// Subject lines are hard-cut to this many characters.
pub const MAX_SUBJECT_CHARS: usize = 80;

const UNTITLED: &str = "(untitled)";

/// One mail for one article: subject `"{feed} - {article}"`.
pub fn article_mail(sub: &Subscription, article: &Article, format: BodyFormat) -> OutgoingMail {
    let title = article.title.as_deref().unwrap_or(UNTITLED);
    let subject = subject_line(&format!("{} - {}", sub.title, title));

    let mut body = String::new();
    match format {
        BodyFormat::Plain => push_plain_block(&mut body, article, sub.desc_length),
        BodyFormat::Html => {
            body.push_str("<html><body>\n");
            push_html_block(&mut body, article, sub.desc_length);
            body.push_str("</body></html>\n");
        }
    }

    OutgoingMail {
        to: sub.email.clone(),
        subject,
        body,
        format,
    }
}

/// One mail listing every article in the order given: subject `"{feed} Digest"`.
pub fn digest_mail(sub: &Subscription, articles: &[Article], format: BodyFormat) -> OutgoingMail {
    let subject = subject_line(&format!("{} Digest", sub.title));

    let mut body = String::new();
    match format {
        BodyFormat::Plain => {
            let heading = single_line(&sub.title);
            let _ = writeln!(body, "{}", heading);
            let _ = writeln!(body, "{}\n", "=".repeat(heading.chars().count()));
            for (i, article) in articles.iter().enumerate() {
                if i > 0 {
                    body.push_str("\n----\n\n");
                }
                push_plain_block(&mut body, article, sub.desc_length);
            }
        }
        BodyFormat::Html => {
            body.push_str("<html><body>\n");
            let _ = writeln!(body, "<h1>{}</h1>", escape_html(&sub.title));
            for (i, article) in articles.iter().enumerate() {
                if i > 0 {
                    body.push_str("<hr>\n");
                }
                push_html_block(&mut body, article, sub.desc_length);
            }
            body.push_str("</body></html>\n");
        }
    }

    OutgoingMail {
        to: sub.email.clone(),
        subject,
        body,
        format,
    }
}

fn subject_line(raw: &str) -> String {
    single_line(raw).chars().take(MAX_SUBJECT_CHARS).collect()
}

fn description(article: &Article, desc_length: u32) -> Option<String> {
    let desc = article.description.as_deref()?.trim();
    if desc.is_empty() || desc_length == 0 {
        return None;
    }
    Some(truncate_chars(desc, desc_length as usize).into_owned())
}

fn published(article: &Article) -> Option<String> {
    article
        .published_at
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
}

fn push_plain_block(out: &mut String, article: &Article, desc_length: u32) {
    let _ = writeln!(
        out,
        "{}",
        single_line(article.title.as_deref().unwrap_or(UNTITLED))
    );
    let _ = writeln!(out, "{}", article.url);
    if let Some(author) = &article.author {
        let _ = writeln!(out, "By {}", single_line(author));
    }
    if let Some(date) = published(article) {
        let _ = writeln!(out, "Published: {}", date);
    }
    if let Some(desc) = description(article, desc_length) {
        let _ = writeln!(out, "\n{}", desc);
    }
}

fn push_html_block(out: &mut String, article: &Article, desc_length: u32) {
    let _ = writeln!(
        out,
        "<h2><a href=\"{}\">{}</a></h2>",
        escape_html(&article.url),
        escape_html(article.title.as_deref().unwrap_or(UNTITLED))
    );
    let mut meta = Vec::new();
    if let Some(author) = &article.author {
        meta.push(format!("By {}", escape_html(author)));
    }
    if let Some(date) = published(article) {
        meta.push(date);
    }
    if !meta.is_empty() {
        let _ = writeln!(out, "<p><small>{}</small></p>", meta.join(" &middot; "));
    }
    if let Some(desc) = description(article, desc_length) {
        let _ = writeln!(out, "<p>{}</p>", escape_html(&desc));
    }
}

/// Escape text for use in HTML element content and double-quoted attributes.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn subscription(title: &str, desc_length: u32) -> Subscription {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Subscription {
            subscription_id: 1,
            feed_id: 1,
            title: title.to_string(),
            url: "https://blog.example/rss".to_string(),
            email: "reader@example.com".to_string(),
            digest: false,
            desc_length,
            attempted_delivery_at: None,
            refreshed_at: None,
            created_at: created,
            updated_at: None,
        }
    }

    fn article(id: i64, title: &str, description: Option<&str>) -> Article {
        Article {
            article_id: id,
            feed_id: 1,
            title: Some(title.to_string()),
            url: format!("https://blog.example/{}", id),
            author: Some("Ann".to_string()),
            description: description.map(str::to_string),
            category: None,
            published_at: Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap()),
            created_at: Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
            updated_at: None,
        }
    }

    #[test]
    fn test_article_mail_plain() {
        let sub = subscription("Blog", 300);
        let mail = article_mail(&sub, &article(7, "Hello", Some("Body text")), BodyFormat::Plain);

        assert_eq!(mail.to, "reader@example.com");
        assert_eq!(mail.subject, "Blog - Hello");
        assert_eq!(mail.format, BodyFormat::Plain);
        assert_eq!(
            mail.body,
            "Hello\nhttps://blog.example/7\nBy Ann\nPublished: 2024-03-05 09:30 UTC\n\nBody text\n"
        );
    }

    #[test]
    fn test_subject_cut_to_80_chars() {
        let sub = subscription("A Very Long Feed Title", 300);
        let long_title = "x".repeat(200);
        let mail = article_mail(&sub, &article(1, &long_title, None), BodyFormat::Plain);
        assert_eq!(mail.subject.chars().count(), MAX_SUBJECT_CHARS);
        assert!(mail.subject.starts_with("A Very Long Feed Title - xxx"));
    }

    #[test]
    fn test_subject_is_single_line() {
        let sub = subscription("Blog", 300);
        let mail = article_mail(&sub, &article(1, "Line one\nline two\r\n", None), BodyFormat::Plain);
        assert_eq!(mail.subject, "Blog - Line one line two");
    }

    #[test]
    fn test_description_truncated_to_desc_length() {
        let sub = subscription("Blog", 10);
        let mail = article_mail(
            &sub,
            &article(1, "T", Some("abcdefghijklmnopqrstuvwxyz")),
            BodyFormat::Plain,
        );
        assert!(mail.body.ends_with("abcdefg...\n"), "body: {}", mail.body);
    }

    #[test]
    fn test_zero_desc_length_omits_description() {
        let sub = subscription("Blog", 0);
        let mail = article_mail(&sub, &article(1, "T", Some("hidden")), BodyFormat::Plain);
        assert!(!mail.body.contains("hidden"));
    }

    #[test]
    fn test_untitled_article() {
        let sub = subscription("Blog", 300);
        let mut a = article(1, "", None);
        a.title = None;
        let mail = article_mail(&sub, &a, BodyFormat::Plain);
        assert_eq!(mail.subject, "Blog - (untitled)");
    }

    #[test]
    fn test_html_escapes_content() {
        let sub = subscription("Tom & Jerry", 300);
        let mail = article_mail(
            &sub,
            &article(1, "<script>alert(1)</script>", Some("a < b")),
            BodyFormat::Html,
        );
        assert_eq!(mail.format, BodyFormat::Html);
        assert!(!mail.body.contains("<script>"));
        assert!(mail.body.contains("&lt;script&gt;"));
        assert!(mail.body.contains("<p>a &lt; b</p>"));
        // Subjects are not HTML
        assert_eq!(mail.subject, "Tom & Jerry - <script>alert(1)</script>");
    }

    #[test]
    fn test_digest_lists_articles_in_order() {
        let sub = subscription("Blog", 300);
        let articles = vec![article(1, "First", None), article(2, "Second", None)];
        let mail = digest_mail(&sub, &articles, BodyFormat::Plain);

        assert_eq!(mail.subject, "Blog Digest");
        assert!(mail.body.starts_with("Blog\n====\n\n"));
        let first = mail.body.find("First").unwrap();
        let second = mail.body.find("Second").unwrap();
        assert!(first < second);
        assert_eq!(mail.body.matches("----").count(), 1);
    }

    #[test]
    fn test_digest_html() {
        let sub = subscription("Blog", 300);
        let articles = vec![article(1, "First", None), article(2, "Second", None)];
        let mail = digest_mail(&sub, &articles, BodyFormat::Html);

        assert!(mail.body.contains("<h1>Blog</h1>"));
        assert!(mail.body.contains("<a href=\"https://blog.example/2\">Second</a>"));
        assert_eq!(mail.body.matches("<hr>").count(), 1);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html(r#"<a href="x">'&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;");
        assert_eq!(escape_html("plain"), "plain");
    }
}
