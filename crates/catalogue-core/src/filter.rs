//! Channel-scoped query filters.
//!
//! A channel configures its searches through its topic (one `key: value`
//! per line) and, optionally, through its name (`filter-<field>-<value>`).
//! Both are owned by the chat platform; this module only parses them.

use std::collections::BTreeMap;

/// Field name → match value. Values containing `*` are wildcard patterns.
pub type Filter = BTreeMap<String, String>;

/// Parses `key: value` lines from a channel topic.
///
/// Lines without a colon, or with an empty key or value, are ignored. The
/// first colon separates key from value; later duplicates win.
pub fn from_topic(topic: &str) -> Filter {
    let mut filter = Filter::new();
    for line in topic.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            continue;
        }
        filter.insert(key.to_string(), value.to_string());
    }
    filter
}

/// Parses a `filter-<field>-<value>` channel name into a prefix filter.
///
/// Underscores in the field become dots (`author_name` → `author.name`) and
/// the value matches as a prefix.
pub fn from_channel_name(name: &str) -> Filter {
    let mut filter = Filter::new();
    if let Some((field, value)) = name
        .strip_prefix("filter-")
        .and_then(|rest| rest.split_once('-'))
    {
        if !field.is_empty() && !value.is_empty() {
            filter.insert(field.replace('_', "."), format!("{}*", value));
        }
    }
    filter
}

/// Effective filter for a channel: name-derived entries, overridden by
/// topic entries with the same key.
pub fn for_channel(name: Option<&str>, topic: Option<&str>) -> Filter {
    let mut filter = name.map(from_channel_name).unwrap_or_default();
    filter.extend(topic.map(from_topic).unwrap_or_default());
    filter
}

/// Renders a filter as `key: value` lines for user messages.
pub fn describe(filter: &Filter) -> String {
    filter
        .iter()
        .map(|(k, v)| format!("{}: {}\n", k, v))
        .collect()
}
