//! Deterministic display names for managed resources.
//!
//! Names embed the logical key so an existing object can be adopted by name when no mapping
//! has been recorded yet. They must stay stable across runs.

use crate::template::{ChannelSpec, ChannelType};

const CHANNEL_NAME_LIMIT: usize = 90;
const SHORT_KEY_LEN: usize = 12;

pub fn role_name(prefix: &str, display_name: &str, key: &str) -> String {
    tagged(prefix, display_name, key)
}

pub fn category_name(prefix: &str, display_name: &str, key: &str) -> String {
    tagged(prefix, display_name, key)
}

/// `slug(name)-shortkey`, truncated to the platform channel-name limit.
pub fn text_channel_name(display_name: &str, key: &str) -> String {
    let short: String = strip_key_prefix(key).to_lowercase().chars().take(SHORT_KEY_LEN).collect();
    let combined = [slugify(display_name), short]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    combined.chars().take(CHANNEL_NAME_LIMIT).collect()
}

pub fn channel_name(prefix: &str, spec: &ChannelSpec) -> String {
    match spec.channel_type {
        ChannelType::Category => category_name(prefix, &spec.name, &spec.key),
        ChannelType::Text => text_channel_name(&spec.name, &spec.key),
    }
}

/// Marker embedded verbatim in managed message content.
pub fn message_marker(key: &str) -> String {
    format!("〔{}〕", key)
}

fn tagged(prefix: &str, display_name: &str, key: &str) -> String {
    let tag = message_marker(key);
    if prefix.is_empty() {
        format!("{} {}", display_name, tag)
    } else {
        format!("{} {} {}", prefix, display_name, tag)
    }
}

fn strip_key_prefix(key: &str) -> &str {
    let key = key.strip_prefix("CH_").unwrap_or(key);
    key.strip_prefix("CAT_").unwrap_or(key)
}

/// Lowercase; whitespace and `_` become `-`; anything not alphanumeric or `-` is dropped;
/// dash runs collapse and leading/trailing dashes are trimmed.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        let c = if c.is_whitespace() || c == '_' { '-' } else { c };
        if !(c.is_alphanumeric() || c == '-') {
            continue;
        }
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}
