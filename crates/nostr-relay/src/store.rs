//! Durable event persistence, filter-driven queries, and the read-time
//! collapse/masking rules: replaceable-event collapse, NIP-09 deletion
//! masking, NIP-40 expiration, gift-wrap visibility.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use nostr::{is_ephemeral, is_parameterized_replaceable, is_replaceable, Event, KIND_DELETION};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::error::Result;
use crate::subscription::Filter;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: PathBuf::from(":memory:"), max_pool_size: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub gift_wrap_recipients: Option<Vec<String>>,
    /// Carried per the store interface shape; group (NIP-29) visibility
    /// projection itself is out of scope and never consulted here.
    pub group_viewer_pubkeys: Option<Vec<String>>,
}

pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let manager = if config.path.as_os_str() == ":memory:" {
            SqliteConnectionManager::file("file::memory:?cache=shared").with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            SqliteConnectionManager::file(&config.path)
        };
        let pool = Pool::builder().max_size(config.max_pool_size).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                event_id   TEXT PRIMARY KEY,
                pubkey     TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind       INTEGER NOT NULL,
                tags       TEXT NOT NULL,
                content    TEXT NOT NULL,
                sig        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at DESC);",
        )?;

        Ok(Self { pool })
    }

    /// Idempotent by event id. Ephemeral-kind events are accepted by the
    /// pipeline but never persisted, since they can never be returned by a
    /// query or count.
    pub fn insert_event(&self, event: &Event) -> Result<InsertOutcome> {
        if is_ephemeral(event.kind) {
            return Ok(InsertOutcome::Inserted);
        }
        let conn = self.pool.get()?;
        let tags_json = serde_json::to_string(&event.tags)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO events (event_id, pubkey, created_at, kind, tags, content, sig)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![event.id, event.pubkey, event.created_at, event.kind as i64, tags_json, event.content, event.sig],
        )?;
        Ok(if changed > 0 { InsertOutcome::Inserted } else { InsertOutcome::Duplicate })
    }

    pub fn query_events(&self, filters: &[Filter], opts: &QueryOptions) -> Result<Vec<Event>> {
        let candidates = self.load_candidates(filters)?;
        let visible = self.apply_visibility(candidates, filters, opts)?;

        let has_search = filters.iter().any(|f| f.search.as_deref().is_some_and(|s| !s.is_empty()));
        let mut matched: Vec<Event> = visible.into_iter().filter(|e| filters.iter().any(|f| f.matches(e))).collect();

        if !has_search {
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        }

        if let Some(limit) = filters.iter().filter_map(|f| f.limit).min() {
            matched.truncate(limit);
        }

        Ok(matched)
    }

    pub fn count_events(&self, filters: &[Filter], opts: &QueryOptions) -> Result<u64> {
        Ok(self.query_events(filters, opts)?.len() as u64)
    }

    /// Looks up the author of a stored event, used by StorePolicy's
    /// NIP-09 "cannot delete another author's event" check.
    pub fn lookup_author(&self, event_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT pubkey FROM events WHERE event_id = ?1")?;
        let author = stmt.query_row(params![event_id], |row| row.get::<_, String>(0)).ok();
        Ok(author)
    }

    pub fn event_matches_filters(&self, event_id: &str, filters: &[Filter]) -> Result<bool> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT event_id, pubkey, created_at, kind, tags, content, sig FROM events WHERE event_id = ?1")?;
        let event = stmt.query_row(params![event_id], row_to_event).ok();
        Ok(event.is_some_and(|e| filters.iter().any(|f| f.matches(&e))))
    }

    /// Test-only: wipes all stored events.
    pub fn clear(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM events", [])?;
        Ok(())
    }

    fn load_candidates(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let conn = self.pool.get()?;
        // Kinds are pre-filtered in SQL when every filter constrains them;
        // everything else runs in-memory through Filter::matches.
        let all_kinds_constrained = filters.iter().all(|f| f.kinds.is_some());
        let mut rows = Vec::new();

        if all_kinds_constrained && !filters.is_empty() {
            let mut kinds: Vec<i64> = filters.iter().flat_map(|f| f.kinds.clone().unwrap_or_default()).map(|k| k as i64).collect();
            kinds.sort_unstable();
            kinds.dedup();
            let placeholders = kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT event_id, pubkey, created_at, kind, tags, content, sig FROM events WHERE kind IN ({placeholders}) ORDER BY created_at DESC, event_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::ToSql> = kinds.iter().map(|k| k as &dyn rusqlite::ToSql).collect();
            let mapped = stmt.query_map(params.as_slice(), row_to_event)?;
            for row in mapped {
                rows.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT event_id, pubkey, created_at, kind, tags, content, sig FROM events ORDER BY created_at DESC, event_id ASC",
            )?;
            let mapped = stmt.query_map([], row_to_event)?;
            for row in mapped {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    fn apply_visibility(&self, candidates: Vec<Event>, filters: &[Filter], opts: &QueryOptions) -> Result<Vec<Event>> {
        let now = now_unix();
        let without_expired: Vec<Event> = candidates.into_iter().filter(|e| !is_expired(e, now)).collect();
        let without_gift_wrap = filter_gift_wrap(without_expired, opts);
        let authors: Vec<String> = without_gift_wrap.iter().map(|e| e.pubkey.clone()).collect();
        let deletions = self.load_deletions_for_authors(&authors)?;
        let unmasked = without_gift_wrap.into_iter().filter(|e| !is_deleted(e, &deletions)).collect::<Vec<_>>();

        let ids_only_query = !filters.is_empty() && filters.iter().all(|f| f.is_ids_only());
        let has_kind_41 = unmasked.iter().any(|e| e.kind == nostr::KIND_CHANNEL_METADATA);
        if ids_only_query && !has_kind_41 {
            return Ok(unmasked);
        }

        Ok(collapse_replaceable(unmasked))
    }

    fn load_deletions_for_authors(&self, authors: &[String]) -> Result<Vec<Event>> {
        if authors.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get()?;
        let placeholders = authors.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT event_id, pubkey, created_at, kind, tags, content, sig FROM events WHERE kind = {KIND_DELETION} AND pubkey IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = authors.iter().map(|a| a as &dyn rusqlite::ToSql).collect();
        let now = now_unix();
        let mapped = stmt.query_map(params.as_slice(), row_to_event)?;
        let mut deletions = Vec::new();
        for row in mapped {
            let event = row?;
            if !is_expired(&event, now) {
                deletions.push(event);
            }
        }
        Ok(deletions)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(4)?;
    let tags: Vec<Vec<String>> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        created_at: row.get(2)?,
        kind: row.get::<_, i64>(3)? as u64,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

fn is_expired(event: &Event, now: i64) -> bool {
    event.expiration().is_some_and(|exp| exp <= now)
}

/// If `gift_wrap_recipients` is absent, kind-4/kind-1059 events are excluded
/// outright. If present and non-empty, only those whose `p` tag values
/// intersect the recipient list survive. If present but empty, all are
/// excluded.
fn filter_gift_wrap(events: Vec<Event>, opts: &QueryOptions) -> Vec<Event> {
    const KIND_ENCRYPTED_DM: u64 = 4;
    events
        .into_iter()
        .filter(|e| {
            if e.kind != KIND_ENCRYPTED_DM && e.kind != nostr::KIND_GIFT_WRAP {
                return true;
            }
            match &opts.gift_wrap_recipients {
                None => false,
                Some(recipients) if recipients.is_empty() => false,
                Some(recipients) => e.tag_values("p").any(|p| recipients.iter().any(|r| r == p)),
            }
        })
        .collect()
}

fn is_deleted(event: &Event, deletions: &[Event]) -> bool {
    for deletion in deletions {
        if deletion.pubkey != event.pubkey {
            continue;
        }
        let allowed_kinds: Vec<u64> = deletion.tag_values("k").filter_map(|k| k.parse().ok()).collect();
        let kind_allowed = allowed_kinds.is_empty() || allowed_kinds.contains(&event.kind);

        let e_target_hit = kind_allowed && deletion.tag_values("e").any(|id| id == event.id);

        let d_tag = event.first_tag_value("d").unwrap_or("");
        let a_target_hit = deletion.tag_values("a").any(|coord| {
            let mut parts = coord.splitn(3, ':');
            let kind: Option<u64> = parts.next().and_then(|k| k.parse().ok());
            let pubkey = parts.next();
            let d = parts.next().unwrap_or("");
            kind == Some(event.kind)
                && pubkey == Some(deletion.pubkey.as_str())
                && pubkey == Some(event.pubkey.as_str())
                && d == d_tag
                && deletion.created_at >= event.created_at
        });

        if e_target_hit || a_target_hit {
            return true;
        }
    }
    false
}

/// Collapses replaceable / parameterized-replaceable / kind-41 groups,
/// keeping the newest by `(created_at, id)` with ties broken toward the
/// lexicographically smaller id. Skipped when every candidate event is
/// regular (no collapse key applies to any of them).
fn collapse_replaceable(events: Vec<Event>) -> Vec<Event> {
    use std::collections::HashMap;

    #[derive(Hash, Eq, PartialEq)]
    enum Key {
        Replaceable(String, u64),
        Parameterized(String, u64, String),
        ChannelRoot(String),
    }

    fn collapse_key(event: &Event) -> Option<Key> {
        const KIND_CHANNEL_METADATA: u64 = nostr::KIND_CHANNEL_METADATA;
        if event.kind == KIND_CHANNEL_METADATA {
            let root = event
                .tags
                .iter()
                .find(|t| t.first().map(String::as_str) == Some("e") && t.get(2..).is_some_and(|rest| rest.iter().any(|v| v == "root")))
                .or_else(|| event.tags.iter().find(|t| t.first().map(String::as_str) == Some("e")))
                .and_then(|t| t.get(1))
                .cloned();
            return root.map(Key::ChannelRoot);
        }
        if is_replaceable(event.kind) {
            return Some(Key::Replaceable(event.pubkey.clone(), event.kind));
        }
        if is_parameterized_replaceable(event.kind) {
            let d_tag = event.first_tag_value("d").unwrap_or("").to_string();
            return Some(Key::Parameterized(event.pubkey.clone(), event.kind, d_tag));
        }
        None
    }

    let mut winners: HashMap<Key, Event> = HashMap::new();
    let mut regular: Vec<Event> = Vec::new();

    for event in events {
        match collapse_key(&event) {
            None => regular.push(event),
            Some(key) => {
                winners
                    .entry(key)
                    .and_modify(|incumbent| {
                        if (event.created_at, &event.id) > (incumbent.created_at, &incumbent.id) {
                            *incumbent = event.clone();
                        }
                    })
                    .or_insert(event);
            }
        }
    }

    regular.extend(winners.into_values());
    regular
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{finalize_event, generate_secret_key, EventTemplate, KIND_SHORT_TEXT_NOTE};

    fn db() -> Database {
        Database::new(DatabaseConfig { path: PathBuf::from(":memory:"), max_pool_size: 1 }).unwrap()
    }

    fn note(sk: &bitcoin::secp256k1::SecretKey, created_at: i64, content: &str) -> Event {
        finalize_event(&EventTemplate { created_at, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: content.into() }, sk).unwrap()
    }

    #[test]
    fn insert_is_idempotent() {
        let db = db();
        let sk = generate_secret_key();
        let event = note(&sk, 1, "hi");
        assert_eq!(db.insert_event(&event).unwrap(), InsertOutcome::Inserted);
        assert_eq!(db.insert_event(&event).unwrap(), InsertOutcome::Duplicate);

        let found = db.query_events(&[Filter::new().ids(vec![event.id.clone()])], &QueryOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn replaceable_collapse_keeps_newest() {
        let db = db();
        let sk = generate_secret_key();
        let older = finalize_event(&EventTemplate { created_at: 1, kind: nostr::KIND_METADATA, tags: vec![], content: "old".into() }, &sk).unwrap();
        let newer = finalize_event(&EventTemplate { created_at: 2, kind: nostr::KIND_METADATA, tags: vec![], content: "new".into() }, &sk).unwrap();
        db.insert_event(&older).unwrap();
        db.insert_event(&newer).unwrap();

        let found = db.query_events(&[Filter::new().kinds(vec![nostr::KIND_METADATA])], &QueryOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "new");
    }

    #[test]
    fn deletion_masks_targeted_event_from_same_author() {
        let db = db();
        let sk = generate_secret_key();
        let target = note(&sk, 1, "delete me");
        db.insert_event(&target).unwrap();

        let deletion = finalize_event(
            &EventTemplate { created_at: 2, kind: nostr::KIND_DELETION, tags: vec![vec!["e".into(), target.id.clone()]], content: String::new() },
            &sk,
        )
        .unwrap();
        db.insert_event(&deletion).unwrap();

        let found = db.query_events(&[Filter::new().ids(vec![target.id.clone()])], &QueryOptions::default()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn deletion_from_different_author_is_a_no_op() {
        let db = db();
        let sk = generate_secret_key();
        let other_sk = generate_secret_key();
        let target = note(&sk, 1, "keep me");
        db.insert_event(&target).unwrap();

        let deletion = finalize_event(
            &EventTemplate { created_at: 2, kind: nostr::KIND_DELETION, tags: vec![vec!["e".into(), target.id.clone()]], content: String::new() },
            &other_sk,
        )
        .unwrap();
        db.insert_event(&deletion).unwrap();

        let found = db.query_events(&[Filter::new().ids(vec![target.id.clone()])], &QueryOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn ephemeral_events_are_never_returned() {
        let db = db();
        let sk = generate_secret_key();
        let event = finalize_event(&EventTemplate { created_at: 1, kind: 20_001, tags: vec![], content: "ephemeral".into() }, &sk).unwrap();
        db.insert_event(&event).unwrap();
        let found = db.query_events(&[Filter::new().kinds(vec![20_001])], &QueryOptions::default()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn expired_events_are_excluded() {
        let db = db();
        let sk = generate_secret_key();
        let mut event = note(&sk, 1, "expired");
        event.tags.push(vec!["expiration".into(), "1".into()]);
        // re-sign is unnecessary for this store-level test; the store only reads tags.
        db.insert_event(&event).unwrap();
        let found = db.query_events(&[Filter::new().ids(vec![event.id.clone()])], &QueryOptions::default()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn gift_wrap_excluded_without_recipients_opt() {
        let db = db();
        let sk = generate_secret_key();
        let event = finalize_event(
            &EventTemplate { created_at: 1, kind: nostr::KIND_GIFT_WRAP, tags: vec![vec!["p".into(), "abc".into()]], content: "wrapped".into() },
            &sk,
        )
        .unwrap();
        db.insert_event(&event).unwrap();

        let found = db.query_events(&[Filter::new().kinds(vec![nostr::KIND_GIFT_WRAP])], &QueryOptions::default()).unwrap();
        assert!(found.is_empty());

        let opts = QueryOptions { gift_wrap_recipients: Some(vec!["abc".into()]), ..Default::default() };
        let found = db.query_events(&[Filter::new().kinds(vec![nostr::KIND_GIFT_WRAP])], &opts).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn ids_only_query_skips_replaceable_collapse() {
        let db = db();
        let sk = generate_secret_key();
        let older = finalize_event(&EventTemplate { created_at: 1, kind: nostr::KIND_METADATA, tags: vec![], content: "old".into() }, &sk).unwrap();
        let newer = finalize_event(&EventTemplate { created_at: 2, kind: nostr::KIND_METADATA, tags: vec![], content: "new".into() }, &sk).unwrap();
        db.insert_event(&older).unwrap();
        db.insert_event(&newer).unwrap();

        // A kind-filtered query collapses to the newest.
        let collapsed = db.query_events(&[Filter::new().kinds(vec![nostr::KIND_METADATA])], &QueryOptions::default()).unwrap();
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].content, "new");

        // An ids-only query for the superseded id still returns it directly.
        let found = db.query_events(&[Filter::new().ids(vec![older.id.clone()])], &QueryOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "old");
    }
}
