//! Lightweight HTML scanning for live responses.
//!
//! Only two things are extracted: the document title and hidden form
//! inputs. Markup is not validated; anything that does not look like an
//! `<input>` tag is ignored.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::archive::model::Param;

/// Metadata reported with a successful HTML exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentInfo {
    pub title: Option<String>,
    /// Hidden inputs whose names are on the override allow-list.
    pub hidden_fields: Vec<Param>,
}

fn input_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<input\b[^>]*>").expect("valid input regex"))
}

fn attribute() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#)
            .expect("valid attribute regex")
    })
}

fn title_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"))
}

/// True for content types the scanner understands.
pub fn is_html(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    essence.eq_ignore_ascii_case("text/html") || essence.eq_ignore_ascii_case("application/xhtml+xml")
}

fn attributes(tag: &str) -> HashMap<String, String> {
    attribute()
        .captures_iter(tag)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?.as_str();
            Some((name, decode_entities(value)))
        })
        .collect()
}

/// Scan `body` for the title and allow-listed hidden inputs.
pub fn scan(body: &str, allowed: &[String]) -> DocumentInfo {
    let title = title_tag()
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .filter(|t| !t.is_empty());

    let hidden_fields = input_tag()
        .find_iter(body)
        .filter_map(|tag| {
            let attrs = attributes(tag.as_str());
            let hidden = attrs
                .get("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("hidden"));
            let name = attrs.get("name")?;
            if !hidden || !allowed.iter().any(|a| a == name) {
                return None;
            }
            let value = attrs.get("value").cloned().unwrap_or_default();
            Some(Param::field(name.clone(), value))
        })
        .collect();

    DocumentInfo { title, hidden_fields }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => {
                    let code = if let Some(hex) = entity.strip_prefix("#x").or(entity.strip_prefix("#X")) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        entity.strip_prefix('#').and_then(|dec| dec.parse().ok())
                    };
                    code.and_then(char::from_u32)
                }
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
