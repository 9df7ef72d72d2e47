//! Tag and label helpers
//!
//! Catalog entries carry their metadata as flat `key:value` tag strings.
//! These helpers encode label maps into tags and read them back, and
//! implement the ownership-tag check that gates every deregistration.

use std::collections::BTreeMap;

/// Whether `tags` contains the configured owner tag.
///
/// This is the only filter that authorizes the controller to touch an
/// entry; entries without the tag are out of scope.
pub fn has_owner_tag(tags: &[String], owner_tag: &str) -> bool {
    tags.iter().any(|tag| tag == owner_tag)
}

/// Extract the value of a `key:value` tag.
///
/// Each tag is split once on `:`; the first tag whose left side equals
/// `key` wins. Returns an empty string when no tag matches.
pub fn get_service_tag(tags: &[String], key: &str) -> String {
    for tag in tags {
        if let Some((k, v)) = tag.split_once(':') {
            if k == key {
                return v.to_string();
            }
        }
    }
    String::new()
}

/// Whether a label map satisfies a `key=value` selector.
///
/// An empty selector matches nothing.
pub fn has_label(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => false,
    }
}

/// Encode a label map as catalog tags.
///
/// A label whose value is exactly `tag` is emitted as the bare key;
/// everything else becomes `key:value`. Ordering follows map iteration
/// and is not significant.
pub fn labels_to_tags(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .map(|(key, value)| {
            if value == "tag" {
                key.clone()
            } else {
                format!("{}:{}", key, value)
            }
        })
        .collect()
}
