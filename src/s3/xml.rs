//! Lenient reader for bucket listing documents (`ListBucketResult`).
//!
//! Elements are matched by local name, so the document namespace (or its
//! absence) does not matter. Unknown elements are ignored.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::error::{Result, S3ffsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub contents: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

#[derive(Default)]
struct PendingObject {
    key: Option<String>,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
}

impl ListingPage {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| S3ffsError::Xml(format!("listing is not UTF-8: {}", e)))?;
        if text.trim().is_empty() {
            return Err(S3ffsError::Xml("empty listing document".to_string()));
        }

        let mut page = ListingPage::default();
        let mut stack: Vec<&str> = Vec::new();
        let mut text_buf = String::new();
        let mut object: Option<PendingObject> = None;
        let mut prefix: Option<String> = None;
        let mut saw_root = false;

        for token in Tokenizer::from(text) {
            let token = token.map_err(|e| S3ffsError::Xml(e.to_string()))?;
            match token {
                Token::ElementStart { local, .. } => {
                    let name = local.as_str();
                    saw_root = true;
                    match name {
                        "Contents" => object = Some(PendingObject::default()),
                        "CommonPrefixes" => prefix = None,
                        _ => {}
                    }
                    stack.push(name);
                    text_buf.clear();
                }
                Token::Text { text } => text_buf.push_str(&unescape(text.as_str())?),
                Token::Cdata { text, .. } => text_buf.push_str(text.as_str()),
                Token::ElementEnd { end, .. } => {
                    let closed = match end {
                        ElementEnd::Open => continue,
                        ElementEnd::Empty => {
                            text_buf.clear();
                            stack.pop()
                        }
                        ElementEnd::Close(_, local) => {
                            let open = stack.pop();
                            if open != Some(local.as_str()) {
                                return Err(S3ffsError::Xml(format!(
                                    "mismatched closing tag </{}>",
                                    local.as_str()
                                )));
                            }
                            open
                        }
                    };
                    let Some(name) = closed else {
                        return Err(S3ffsError::Xml("unbalanced document".to_string()));
                    };
                    let parent = stack.last().copied();
                    let value = std::mem::take(&mut text_buf);
                    page.close_element(name, parent, value, &mut object, &mut prefix)?;
                }
                _ => {}
            }
        }

        if !saw_root || !stack.is_empty() {
            return Err(S3ffsError::Xml("truncated listing document".to_string()));
        }
        Ok(page)
    }

    fn close_element(
        &mut self,
        name: &str,
        parent: Option<&str>,
        value: String,
        object: &mut Option<PendingObject>,
        prefix: &mut Option<String>,
    ) -> Result<()> {
        match (parent, name) {
            (Some("Contents"), "Key") => {
                if let Some(obj) = object.as_mut() {
                    obj.key = Some(value);
                }
            }
            (Some("Contents"), "Size") => {
                if let Some(obj) = object.as_mut() {
                    obj.size = value.trim().parse().map_err(|_| {
                        S3ffsError::Xml(format!("invalid object size {:?}", value))
                    })?;
                }
            }
            (Some("Contents"), "LastModified") => {
                if let Some(obj) = object.as_mut() {
                    obj.last_modified = DateTime::parse_from_rfc3339(value.trim())
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
            }
            (_, "Contents") => {
                let obj = object.take().unwrap_or_default();
                let key = obj
                    .key
                    .ok_or_else(|| S3ffsError::Xml("Contents entry without Key".to_string()))?;
                self.contents.push(ObjectEntry {
                    key,
                    size: obj.size,
                    last_modified: obj.last_modified,
                });
            }
            (Some("CommonPrefixes"), "Prefix") => *prefix = Some(value),
            (_, "CommonPrefixes") => {
                if let Some(p) = prefix.take() {
                    self.common_prefixes.push(p);
                }
            }
            (_, "IsTruncated") => self.is_truncated = value.trim().eq_ignore_ascii_case("true"),
            (_, "NextMarker") => {
                let marker = value.trim();
                if !marker.is_empty() {
                    self.next_marker = Some(marker.to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Marker for the next page, or `None` when the listing is exhausted.
    ///
    /// A truncated page without `NextMarker` continues after its last key or
    /// common prefix, whichever sorts later.
    pub fn continuation(&self) -> Option<String> {
        if let Some(marker) = &self.next_marker {
            return Some(marker.clone());
        }
        if !self.is_truncated {
            return None;
        }
        let last_key = self.contents.last().map(|o| o.key.as_str());
        let last_prefix = self.common_prefixes.last().map(String::as_str);
        last_key.max(last_prefix).map(str::to_string)
    }
}

/// Decode the predefined XML entities and numeric character references.
fn unescape(raw: &str) -> Result<Cow<'_, str>> {
    if !raw.contains('&') {
        return Ok(Cow::Borrowed(raw));
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| S3ffsError::Xml(format!("unterminated entity in {:?}", raw)))?;
        let entity = &after[..semi];
        let ch = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "apos" => '\'',
            "quot" => '"',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| S3ffsError::Xml(format!("unknown entity &{};", entity)))?
            }
        };
        out.push(ch);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}
