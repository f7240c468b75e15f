use std::borrow::Cow;

/// Ellipsis appended to truncated text
const ELLIPSIS: &str = "...";

/// Truncates text to at most `max_chars` characters, ellipsis included.
///
/// Counts Unicode scalar values, so multi-byte characters are never split.
/// Returns `Cow::Borrowed` when the text already fits.
///
/// # Examples
///
/// ```
/// use feedmailer::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello World", 8), "Hello...");
/// assert_eq!(truncate_chars("Test", 2), "Te");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    let ellipsis_len = ELLIPSIS.chars().count();

    // Byte offset of the char at position `max_chars`, if the text is longer
    let overflow = match s.char_indices().nth(max_chars) {
        None => return Cow::Borrowed(s),
        Some((idx, _)) => idx,
    };

    // Too narrow for text plus ellipsis: hard cut
    if max_chars <= ellipsis_len {
        return Cow::Owned(s[..overflow].to_string());
    }

    let cut = s
        .char_indices()
        .nth(max_chars - ellipsis_len)
        .map(|(idx, _)| idx)
        .unwrap_or(overflow);
    Cow::Owned(format!("{}{}", s[..cut].trim_end(), ELLIPSIS))
}

/// Collapses text to a single line suitable for a mail header or a listing.
///
/// Drops control characters and ANSI escape sequences, and folds every run
/// of whitespace (newlines included) into one space.
///
/// # Examples
///
/// ```
/// use feedmailer::util::single_line;
///
/// assert_eq!(single_line("Breaking:\n  news\tnow"), "Breaking: news now");
/// assert_eq!(single_line("clean"), "clean");
/// ```
pub fn single_line(s: &str) -> Cow<'_, str> {
    let needs_work = s.chars().any(|c| c.is_control())
        || s.contains("  ")
        || s.starts_with(char::is_whitespace)
        || s.ends_with(char::is_whitespace);
    if !needs_work {
        return Cow::Borrowed(s);
    }

    let stripped = strip_escape_sequences(s);
    let folded: Vec<&str> = stripped
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect();
    Cow::Owned(folded.join(" "))
}

/// Removes ANSI CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ST`) sequences.
fn strip_escape_sequences(s: &str) -> Cow<'_, str> {
    if !s.contains('\x1b') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Bare ESC
            _ => {}
        }
    }

    Cow::Owned(out)
}
