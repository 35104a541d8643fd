use std::collections::HashMap;

use nostr::Event;
use serde_json::Value;

use crate::error::{RelayError, Result};

/// Structural ceiling on `limit`, independent of the configured
/// `limitation.max_limit` (which only clamps, never rejects).
const MAX_VALIDATABLE_LIMIT: usize = 5_000;

/// A subscription query predicate. AND across fields, OR within a field's
/// value list, per the filter/match engine design.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u64>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
    /// Named tag constraints keyed by `#<letter>`, e.g. `"#e"`.
    pub tags: Option<HashMap<String, Vec<String>>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u64>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn tag(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.get_or_insert_with(HashMap::new).insert(name.into(), values);
        self
    }

    /// Parses a single REQ/COUNT filter object as received on the wire.
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RelayError::Nostr(nostr::NostrError::NotAnArray))?;

        let mut filter = Filter::new();
        for (key, v) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_vec(v)),
                "authors" => filter.authors = Some(string_vec(v)),
                "kinds" => {
                    filter.kinds = Some(
                        v.as_array()
                            .into_iter()
                            .flatten()
                            .filter_map(Value::as_u64)
                            .collect(),
                    )
                }
                "since" => filter.since = v.as_u64(),
                "until" => filter.until = v.as_u64(),
                "limit" => filter.limit = v.as_u64().map(|n| n as usize),
                "search" => filter.search = v.as_str().map(str::to_string),
                tag_key if tag_key.starts_with('#') && tag_key.len() == 2 => {
                    filter
                        .tags
                        .get_or_insert_with(HashMap::new)
                        .insert(tag_key.to_string(), string_vec(v));
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    /// Structural validation: a present `limit` must be within the hard
    /// ceiling. Config-driven clamping happens later, in the policy stage.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if limit > MAX_VALIDATABLE_LIMIT {
                return Err(RelayError::Nostr(nostr::NostrError::UnknownMessageKind(
                    "limit exceeds maximum".to_string(),
                )));
            }
        }
        Ok(())
    }

    /// True when `ids` is present and no other predicate constrains the
    /// query. Consulted by the store to skip replaceable-event collapse.
    pub fn is_ids_only(&self) -> bool {
        self.ids.is_some()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.search.is_none()
            && self.tags.is_none()
    }

    /// The shortest prefix length among `ids`/`authors` constraints, used by
    /// the policy stage's `min_prefix_length` check. `None` if neither
    /// constraint is present.
    pub fn shortest_prefix_length(&self) -> Option<usize> {
        self.ids
            .iter()
            .flatten()
            .chain(self.authors.iter().flatten())
            .map(|s| s.len())
            .min()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !matches_prefix_list(ids, &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !matches_prefix_list(authors, &event.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if (event.created_at as u64) < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if (event.created_at as u64) > until {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            for (tag_key, values) in tags {
                let Some(letter) = tag_key.strip_prefix('#') else { continue };
                if !event_has_matching_tag(event, letter, values) {
                    return false;
                }
            }
        }
        if let Some(search) = &self.search {
            if !matches_search(search, &event.content) {
                return false;
            }
        }
        true
    }
}

fn string_vec(value: &Value) -> Vec<String> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Empty candidate lists never match (an explicit `Some(vec![])` excludes
/// everything); otherwise a candidate matches if it is a prefix of `target`
/// or `target` is a prefix of it (full 64-char values compare exactly).
fn matches_prefix_list(candidates: &[String], target: &str) -> bool {
    if candidates.is_empty() {
        return false;
    }
    candidates.iter().any(|c| target.starts_with(c.as_str()))
}

fn event_has_matching_tag(event: &Event, letter: &str, values: &[String]) -> bool {
    if values.is_empty() {
        return false;
    }
    event
        .tags
        .iter()
        .filter(|t| t.first().map(String::as_str) == Some(letter) && t.len() > 1)
        .any(|t| values.iter().any(|v| &t[1] == v))
}

/// NIP-50: substring search over lowercased content, ignoring `key:value`
/// extension tokens. Empty or all-extension search accepts everything.
fn matches_search(search: &str, content: &str) -> bool {
    let lowered_content = content.to_lowercase();
    search
        .split_whitespace()
        .filter(|token| !token.contains(':'))
        .map(|token| token.to_lowercase())
        .all(|token| lowered_content.contains(&token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{finalize_event, generate_secret_key, EventTemplate, KIND_SHORT_TEXT_NOTE};

    fn event_with(tags: Vec<Vec<String>>, content: &str) -> Event {
        let sk = generate_secret_key();
        finalize_event(
            &EventTemplate { created_at: 1_700_000_000, kind: KIND_SHORT_TEXT_NOTE, tags, content: content.into() },
            &sk,
        )
        .unwrap()
    }

    #[test]
    fn empty_kinds_matches_nothing() {
        let event = event_with(vec![], "hi");
        let filter = Filter::new().kinds(vec![]);
        assert!(!filter.matches(&event));
    }

    #[test]
    fn id_prefix_matches() {
        let event = event_with(vec![], "hi");
        let prefix = event.id[..8].to_string();
        let filter = Filter::new().ids(vec![prefix]);
        assert!(filter.matches(&event));
    }

    #[test]
    fn tag_filter_is_or_within_and_and_across() {
        let event = event_with(vec![vec!["e".into(), "abc".into()], vec!["p".into(), "def".into()]], "hi");
        let filter = Filter::new().tag("#e", vec!["abc".into(), "zzz".into()]).tag("#p", vec!["def".into()]);
        assert!(filter.matches(&event));

        let filter_missing_p = Filter::new().tag("#e", vec!["abc".into()]).tag("#p", vec!["nope".into()]);
        assert!(!filter_missing_p.matches(&event));
    }

    #[test]
    fn empty_tag_value_list_matches_nothing() {
        let event = event_with(vec![vec!["e".into(), "abc".into()]], "hi");
        let filter = Filter::new().tag("#e", vec![]);
        assert!(!filter.matches(&event));
    }

    #[test]
    fn search_ignores_extension_tokens() {
        let event = event_with(vec![], "Hello World");
        let filter = Filter::new().search("hello extension:ignored");
        assert!(filter.matches(&event));
    }

    #[test]
    fn validate_rejects_over_max_limit() {
        let filter = Filter::new().limit(5_001);
        assert!(filter.validate().is_err());
    }

    #[test]
    fn validate_accepts_limit_at_max() {
        let filter = Filter::new().limit(5_000);
        assert!(filter.validate().is_ok());
    }
}
