//! Outbound rich-content sanitization.
//!
//! Everything leaving the bridge for a platform's rich-text renderer passes
//! through an allow-list cleaner first. Unknown tags are stripped but keep
//! their inner text; `script` and `style` lose their contents entirely;
//! links survive only with an http/https/mailto `href`. Structured card
//! trees get the same href and text rules applied recursively. Plain text
//! destined for a rich-text field is escaped and wrapped, never interpreted
//! as markup.

use serde_json::Value;
use url::Url;

/// Tags allowed through the HTML sanitizer. Attributes are stripped except
/// where noted ([`sanitize_html`] keeps `href` on links).
const ALLOWED_TAGS: &[&str] = &[
    "p",
    "br",
    "b",
    "strong",
    "i",
    "em",
    "u",
    "s",
    "ul",
    "ol",
    "li",
    "a",
    "code",
    "pre",
    "blockquote",
];

/// Tags whose inner content is dropped along with the tag.
const DROP_CONTENT_TAGS: &[&str] = &["script", "style"];

/// URL schemes a link may carry.
const SAFE_SCHEMES: &[&str] = &["http", "https", "mailto"];

/// JSON keys treated as URL carriers inside structured cards.
const CARD_URL_KEYS: &[&str] = &[
    "url",
    "href",
    "image_url",
    "thumb_url",
    "icon_url",
    "content_url",
    "contenturl",
    "action_url",
];

/// Escape special HTML characters in user-provided text.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Wrap plain text for a rich-text field: escaped, newlines as `<br />`,
/// enclosed in a paragraph.
pub fn wrap_plain_text(text: &str) -> String {
    format!("<p>{}</p>", escape_html(text).replace('\n', "<br />"))
}

/// Whether `href` carries a scheme a link is allowed to keep.
///
/// Relative URLs and unparseable values are rejected along with
/// `javascript:` and every other scheme outside the allow-list.
pub fn safe_href(href: &str) -> bool {
    match Url::parse(href.trim()) {
        Ok(url) => SAFE_SCHEMES.contains(&url.scheme()),
        Err(_) => false,
    }
}

/// Clean an HTML fragment against the tag allow-list.
///
/// Disallowed tags are removed while their text content is kept, except
/// [`DROP_CONTENT_TAGS`] whose contents are removed too. Allowed tags lose
/// every attribute; links keep a `href` only when [`safe_href`] accepts it
/// and are dropped as tags otherwise (their text survives).
pub fn sanitize_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    // Open anchors we refused to emit; their closing tags are swallowed.
    let mut suppressed_anchors: usize = 0;

    while let Some(lt) = rest.find('<') {
        let (text, tail) = rest.split_at(lt);
        out.push_str(text);

        let Some(tag) = parse_tag(tail) else {
            // A bare '<' that does not open a tag is plain text.
            out.push_str("&lt;");
            rest = skip_one_char(tail);
            continue;
        };
        rest = &tail[tag.consumed..];

        if DROP_CONTENT_TAGS.contains(&tag.name.as_str()) {
            if !tag.closing {
                rest = skip_past_closing(rest, &tag.name);
            }
            continue;
        }

        if !ALLOWED_TAGS.contains(&tag.name.as_str()) {
            continue;
        }

        match (tag.name.as_str(), tag.closing) {
            ("br", _) => out.push_str("<br />"),
            ("a", false) => match tag.attr("href").filter(|href| safe_href(href)) {
                Some(href) => {
                    out.push_str("<a href=\"");
                    out.push_str(&escape_attr(&href));
                    out.push_str("\">");
                }
                None => suppressed_anchors = suppressed_anchors.saturating_add(1),
            },
            ("a", true) => {
                if suppressed_anchors > 0 {
                    suppressed_anchors = suppressed_anchors.saturating_sub(1);
                } else {
                    out.push_str("</a>");
                }
            }
            (name, false) => {
                out.push('<');
                out.push_str(name);
                out.push('>');
            }
            (name, true) => {
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
    }

    out.push_str(rest);
    out
}

/// Sanitize a structured card tree (blocks, adaptive cards and the like).
///
/// String values under URL-carrying keys are dropped unless their scheme is
/// safe; every other string value is run through [`sanitize_html`]; objects
/// and arrays are walked recursively.
pub fn sanitize_card(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::with_capacity(map.len());
            for (key, entry) in map {
                match entry {
                    Value::String(s) if is_url_key(key) => {
                        if safe_href(s) {
                            cleaned.insert(key.clone(), Value::String(s.clone()));
                        }
                    }
                    Value::String(s) => {
                        cleaned.insert(key.clone(), Value::String(sanitize_html(s)));
                    }
                    other => {
                        cleaned.insert(key.clone(), sanitize_card(other));
                    }
                }
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_card).collect()),
        other => other.clone(),
    }
}

fn is_url_key(key: &str) -> bool {
    CARD_URL_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

fn escape_attr(value: &str) -> String {
    escape_html(value).replace('"', "&quot;")
}

struct ParsedTag<'a> {
    name: String,
    closing: bool,
    attrs: &'a str,
    consumed: usize,
}

impl ParsedTag<'_> {
    /// Extract an attribute value, case-insensitively.
    fn attr(&self, name: &str) -> Option<String> {
        let lower = self.attrs.to_ascii_lowercase();
        let mut search_from = 0;
        while let Some(found) = lower[search_from..].find(name) {
            let at = search_from.saturating_add(found);
            let before_ok = at == 0
                || lower[..at]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_ascii_whitespace());
            let after = &self.attrs[at.saturating_add(name.len())..];
            if before_ok {
                let after = after.trim_start();
                if let Some(value_part) = after.strip_prefix('=') {
                    let value_part = value_part.trim_start();
                    return Some(read_attr_value(value_part));
                }
            }
            search_from = at.saturating_add(name.len());
        }
        None
    }
}

fn read_attr_value(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(quote @ ('"' | '\'')) => chars.as_str().split(quote).next().unwrap_or("").to_owned(),
        Some(_) => input
            .split(|c: char| c.is_ascii_whitespace())
            .next()
            .unwrap_or("")
            .to_owned(),
        None => String::new(),
    }
}

/// Parse a tag starting at a `<`. Returns `None` when the text is not a
/// well-formed tag (no `>`, or no tag name).
fn parse_tag(input: &str) -> Option<ParsedTag<'_>> {
    let gt = input.find('>')?;
    let inner = &input[1..gt];
    let (closing, body) = match inner.strip_prefix('/') {
        Some(stripped) => (true, stripped),
        None => (false, inner),
    };

    let name_len = body
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(body.len());
    if name_len == 0 {
        return None;
    }

    let name = body[..name_len].to_ascii_lowercase();
    let attrs = body[name_len..].trim_end_matches('/').trim();

    Some(ParsedTag {
        name,
        closing,
        attrs,
        consumed: gt.saturating_add(1),
    })
}

/// Skip past the matching closing tag for a drop-content element.
fn skip_past_closing<'a>(input: &'a str, name: &str) -> &'a str {
    let lower = input.to_ascii_lowercase();
    let needle = format!("</{name}");
    match lower.find(&needle) {
        Some(at) => match lower[at..].find('>') {
            Some(end) => &input[at.saturating_add(end).saturating_add(1)..],
            None => "",
        },
        None => "",
    }
}

fn skip_one_char(input: &str) -> &str {
    let mut chars = input.chars();
    chars.next();
    chars.as_str()
}
