//! Markup documents reduced to the URL-bearing attributes the mirror reads
//! and rewrites.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use encoding_rs::{Encoding, UTF_8};
use lol_html::errors::AttributeNameError;
use lol_html::html_content::Element;
use lol_html::{RewriteStrSettings, element, rewrite_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// `link@href`
    Link,
    /// `script@src`
    Script,
    /// `img@src`
    Image,
    /// `a@href`
    Anchor,
}

impl ReferenceKind {
    pub fn attribute(self) -> &'static str {
        match self {
            Self::Link | Self::Anchor => "href",
            Self::Script | Self::Image => "src",
        }
    }

    pub fn is_asset(self) -> bool {
        !matches!(self, Self::Anchor)
    }
}

/// Position of a reference in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub id: ReferenceId,
    pub kind: ReferenceKind,
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("not an html document")]
    NotHtml,
    #[error("html rewrite error: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
}

/// What the page processor needs from a parsed document: enumerate the
/// references of interest, replace one attribute value, serialize.
pub trait MarkupDocument {
    fn references(&self) -> Vec<Reference>;
    fn rewrite(&mut self, id: ReferenceId, value: String);
    fn serialize(&self) -> Result<String, DocumentError>;

    /// Serialized markup as the bytes to write to disk.
    fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        self.serialize().map(String::into_bytes)
    }
}

/// HTML document backed by `lol_html`.
///
/// The source is kept verbatim; rewrites are recorded by reference id and
/// applied in a second streaming pass on [`MarkupDocument::serialize`], so
/// untouched markup is reproduced byte for byte. Documents decoded from a
/// legacy charset are encoded back into it by [`MarkupDocument::to_bytes`].
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    source: String,
    encoding: &'static Encoding,
    references: Vec<Reference>,
    rewrites: HashMap<ReferenceId, String>,
}

impl HtmlDocument {
    pub fn parse(source: impl Into<String>) -> Result<Self, DocumentError> {
        Self::parse_with_encoding(source.into(), UTF_8)
    }

    /// Decodes raw markup using, in order, a byte order mark, the charset of
    /// `content_type`, a `<meta>` charset declaration, and UTF-8.
    pub fn from_bytes(bytes: &[u8], content_type: Option<&str>) -> Result<Self, DocumentError> {
        let declared = content_type
            .and_then(charset_from_content_type)
            .or_else(|| charset_from_meta(bytes))
            .unwrap_or(UTF_8);
        let (text, encoding, had_errors) = declared.decode(bytes);
        if had_errors {
            tracing::debug!(
                encoding = encoding.name(),
                "malformed byte sequences replaced while decoding"
            );
        }
        Self::parse_with_encoding(text.into_owned(), encoding.output_encoding())
    }

    fn parse_with_encoding(
        source: String,
        encoding: &'static Encoding,
    ) -> Result<Self, DocumentError> {
        if !looks_like_html(&source) {
            return Err(DocumentError::NotHtml);
        }

        let next_id = Cell::new(0_usize);
        let found = RefCell::new(Vec::new());
        rewrite_str(
            &source,
            RewriteStrSettings {
                element_content_handlers: vec![
                    element!("link[href]", |el| {
                        record(el, ReferenceKind::Link, &next_id, &found);
                        Ok(())
                    }),
                    element!("script[src]", |el| {
                        record(el, ReferenceKind::Script, &next_id, &found);
                        Ok(())
                    }),
                    element!("img[src]", |el| {
                        record(el, ReferenceKind::Image, &next_id, &found);
                        Ok(())
                    }),
                    element!("a[href]", |el| {
                        record(el, ReferenceKind::Anchor, &next_id, &found);
                        Ok(())
                    }),
                ],
                ..RewriteStrSettings::new()
            },
        )?;

        Ok(Self {
            source,
            encoding,
            references: found.into_inner(),
            rewrites: HashMap::new(),
        })
    }
}

impl MarkupDocument for HtmlDocument {
    fn references(&self) -> Vec<Reference> {
        self.references.clone()
    }

    fn rewrite(&mut self, id: ReferenceId, value: String) {
        self.rewrites.insert(id, value);
    }

    fn serialize(&self) -> Result<String, DocumentError> {
        if self.rewrites.is_empty() {
            return Ok(self.source.clone());
        }

        let next_id = Cell::new(0_usize);
        let rewrites = &self.rewrites;
        let html = rewrite_str(
            &self.source,
            RewriteStrSettings {
                element_content_handlers: vec![
                    element!("link[href]", |el| {
                        apply(el, ReferenceKind::Link, &next_id, rewrites)?;
                        Ok(())
                    }),
                    element!("script[src]", |el| {
                        apply(el, ReferenceKind::Script, &next_id, rewrites)?;
                        Ok(())
                    }),
                    element!("img[src]", |el| {
                        apply(el, ReferenceKind::Image, &next_id, rewrites)?;
                        Ok(())
                    }),
                    element!("a[href]", |el| {
                        apply(el, ReferenceKind::Anchor, &next_id, rewrites)?;
                        Ok(())
                    }),
                ],
                ..RewriteStrSettings::new()
            },
        )?;
        Ok(html)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let html = self.serialize()?;
        if self.encoding == UTF_8 {
            return Ok(html.into_bytes());
        }
        // Characters the target charset lacks become numeric references.
        let (bytes, _, _) = self.encoding.encode(&html);
        Ok(bytes.into_owned())
    }
}

fn take_id(next_id: &Cell<usize>) -> ReferenceId {
    let id = next_id.get();
    next_id.set(id + 1);
    ReferenceId(id)
}

fn record(
    el: &Element<'_, '_>,
    kind: ReferenceKind,
    next_id: &Cell<usize>,
    found: &RefCell<Vec<Reference>>,
) {
    let id = take_id(next_id);
    if let Some(value) = el.get_attribute(kind.attribute()) {
        found.borrow_mut().push(Reference {
            id,
            kind,
            value: html_escape::decode_html_entities(&value).into_owned(),
        });
    }
}

fn apply(
    el: &mut Element<'_, '_>,
    kind: ReferenceKind,
    next_id: &Cell<usize>,
    rewrites: &HashMap<ReferenceId, String>,
) -> Result<(), AttributeNameError> {
    let id = take_id(next_id);
    match rewrites.get(&id) {
        Some(value) => el.set_attribute(kind.attribute(), value),
        None => Ok(()),
    }
}

fn looks_like_html(source: &str) -> bool {
    if source.trim().is_empty() {
        return false;
    }
    let lowered = source.trim_start().to_ascii_lowercase();
    lowered.starts_with("<!doctype html") || lowered.starts_with('<') || lowered.contains("<html")
}

fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches(['"', '\'']).as_bytes())
    })
}

/// Looks for `<meta charset=..>` or `<meta http-equiv .. content="..;
/// charset=..">` in the first kilobyte.
fn charset_from_meta(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(1024)];
    let lowered = head.to_ascii_lowercase();
    let mut rest = lowered.as_slice();
    while let Some(start) = find(rest, b"<meta") {
        let tag = &rest[start..];
        let tag = &tag[..find(tag, b">").unwrap_or(tag.len())];
        if let Some(label) = find(tag, b"charset").and_then(|at| charset_label(&tag[at + 7..])) {
            let encoding = Encoding::for_label(label)?;
            // A meta tag readable as ASCII cannot really be UTF-16.
            if encoding == encoding_rs::UTF_16LE || encoding == encoding_rs::UTF_16BE {
                return Some(UTF_8);
            }
            return Some(encoding);
        }
        rest = &rest[start + 5..];
    }
    None
}

fn charset_label(after_name: &[u8]) -> Option<&[u8]> {
    let value = after_name.trim_ascii_start().strip_prefix(b"=")?.trim_ascii_start();
    let value = value
        .strip_prefix(b"\"")
        .or_else(|| value.strip_prefix(b"'"))
        .unwrap_or(value);
    let end = value
        .iter()
        .position(|&b| {
            matches!(b, b'"' | b'\'' | b';' | b'/' | b'>') || b.is_ascii_whitespace()
        })
        .unwrap_or(value.len());
    (end > 0).then(|| &value[..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
