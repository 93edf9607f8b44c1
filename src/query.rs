//! Query plans for the range query and replay engines.
//!
//! `ListQuery` enumerates the four listing shapes. Each shape renders to one
//! SQL statement plus its bound parameters, so the modes can be inspected and
//! tested without a database.
//!
//! Prefix patterns are rendered as a half-open range `[prefix, successor)`
//! over the binary-collated `name` column instead of `LIKE`, keeping `_` and
//! `%` inside keys literal and matching case-sensitive.

use rusqlite::types::Value;

use crate::constants::KEY_WILDCARD;
use crate::constants::SQL_UNBOUNDED_LIMIT;
use crate::record::Revision;
use crate::record::RECORD_COLUMNS;

/// A key argument: an exact name, or a prefix when it ends in `%`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPattern<'a> {
    Exact(&'a str),
    Prefix(&'a str),
}

impl<'a> KeyPattern<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.strip_suffix(KEY_WILDCARD) {
            Some(prefix) => KeyPattern::Prefix(prefix),
            None => KeyPattern::Exact(raw),
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, KeyPattern::Prefix(_))
    }

    /// Append a predicate on `{alias}.name` to `sql` and its parameters to `params`.
    fn push_filter(&self, alias: &str, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            KeyPattern::Exact(key) => {
                sql.push_str(&format!("{alias}.name = ?"));
                params.push(Value::Text((*key).to_string()));
            }
            KeyPattern::Prefix(prefix) => {
                sql.push_str(&format!("{alias}.name >= ?"));
                params.push(Value::Text((*prefix).to_string()));
                if let Some(upper) = prefix_upper_bound(prefix) {
                    sql.push_str(&format!(" AND {alias}.name < ?"));
                    params.push(Value::Text(upper));
                }
            }
        }
    }
}

/// Smallest string greater than every string starting with `prefix`.
///
/// Returns `None` when no such bound exists (empty prefix, or a prefix made
/// entirely of `char::MAX`), meaning the range is unbounded above. UTF-8 byte
/// order equals code point order, so this bound is valid under SQLite's
/// BINARY collation.
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // Skip the surrogate block, which has no `char` representation.
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(next) = char::from_u32(next) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Row budget for a listing: `limit <= 0` is unbounded, `N` fetches `N + 1`.
fn fetch_limit(limit: i64) -> i64 {
    if limit <= 0 {
        SQL_UNBOUNDED_LIMIT
    } else {
        limit.saturating_add(1)
    }
}

/// One of the four listing shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListQuery<'a> {
    /// Latest row of one exact key.
    Point { key: &'a str },
    /// Latest row of every matching key.
    Live { pattern: KeyPattern<'a>, limit: i64 },
    /// Latest row at or below `revision` of every matching key.
    AsOf {
        pattern: KeyPattern<'a>,
        revision: Revision,
        limit: i64,
    },
    /// `AsOf` restricted to keys strictly after `after`.
    Resume {
        pattern: KeyPattern<'a>,
        revision: Revision,
        after: &'a str,
        limit: i64,
    },
}

impl<'a> ListQuery<'a> {
    /// Select the query shape for a listing request.
    pub fn plan(as_of: Revision, limit: i64, key: &'a str, resume_key: &'a str) -> Self {
        let pattern = KeyPattern::parse(key);
        if as_of <= 0 {
            return match pattern {
                KeyPattern::Exact(key) => ListQuery::Point { key },
                pattern => ListQuery::Live {
                    pattern,
                    limit: fetch_limit(limit),
                },
            };
        }
        if resume_key.is_empty() {
            ListQuery::AsOf {
                pattern,
                revision: as_of,
                limit: fetch_limit(limit),
            }
        } else {
            ListQuery::Resume {
                pattern,
                revision: as_of,
                after: resume_key,
                limit: fetch_limit(limit),
            }
        }
    }

    /// Revision a resumed listing reports regardless of what it scans.
    pub fn pinned_revision(&self) -> Option<Revision> {
        match self {
            ListQuery::Resume { revision, .. } => Some(*revision),
            _ => None,
        }
    }

    /// Render the statement and its positional parameters.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let (pattern, revision, after, limit) = match self {
            ListQuery::Point { key } => {
                let sql = format!(
                    "SELECT id, {RECORD_COLUMNS} FROM key_value WHERE name = ? ORDER BY revision DESC LIMIT 1"
                );
                params.push(Value::Text((*key).to_string()));
                return (sql, params);
            }
            ListQuery::Live { pattern, limit } => (pattern, None, None, *limit),
            ListQuery::AsOf {
                pattern,
                revision,
                limit,
            } => (pattern, Some(*revision), None, *limit),
            ListQuery::Resume {
                pattern,
                revision,
                after,
                limit,
            } => (pattern, Some(*revision), Some(*after), *limit),
        };

        let mut sql = String::from(
            "SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, kv.create_revision, \
             kv.revision, kv.ttl, kv.version, kv.del \
             FROM key_value kv \
             INNER JOIN (SELECT MAX(kvi.revision) AS revision, kvi.name FROM key_value kvi WHERE ",
        );
        pattern.push_filter("kvi", &mut sql, &mut params);
        if let Some(revision) = revision {
            sql.push_str(" AND kvi.revision <= ?");
            params.push(Value::Integer(revision));
        }
        if let Some(after) = after {
            sql.push_str(" AND kvi.name > ?");
            params.push(Value::Text(after.to_string()));
        }
        sql.push_str(
            " GROUP BY kvi.name) AS r ON r.name = kv.name AND r.revision = kv.revision \
             ORDER BY kv.name ASC LIMIT ?",
        );
        params.push(Value::Integer(limit));
        (sql, params)
    }
}

/// Every row of the matching keys from `from_revision` on, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayQuery<'a> {
    pub pattern: KeyPattern<'a>,
    pub from_revision: Revision,
}

impl<'a> ReplayQuery<'a> {
    pub fn new(key: &'a str, from_revision: Revision) -> Self {
        Self {
            pattern: KeyPattern::parse(key),
            from_revision,
        }
    }

    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("SELECT kv.id, {} FROM key_value kv WHERE ", qualified_columns("kv"));
        self.pattern.push_filter("kv", &mut sql, &mut params);
        sql.push_str(" AND kv.revision >= ? ORDER BY kv.revision ASC");
        params.push(Value::Integer(self.from_revision));
        (sql, params)
    }
}

fn qualified_columns(alias: &str) -> String {
    RECORD_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pattern() {
        assert_eq!(KeyPattern::parse("/registry/pods/%"), KeyPattern::Prefix("/registry/pods/"));
        assert_eq!(KeyPattern::parse("/registry/pods/a"), KeyPattern::Exact("/registry/pods/a"));
        assert_eq!(KeyPattern::parse("%"), KeyPattern::Prefix(""));
        // only a trailing wildcard counts
        assert_eq!(KeyPattern::parse("a%b"), KeyPattern::Exact("a%b"));
    }

    #[test]
    fn only_trailing_wildcard_is_a_range() {
        assert!(KeyPattern::parse("a/%").is_range());
        assert!(KeyPattern::parse("%").is_range());
        assert!(!KeyPattern::parse("a_b").is_range());
        assert!(!KeyPattern::parse("a%b").is_range());
    }

    #[test]
    fn upper_bound_increments_last_char() {
        assert_eq!(prefix_upper_bound("abc").as_deref(), Some("abd"));
        assert_eq!(prefix_upper_bound("a/").as_deref(), Some("a0"));
        assert_eq!(prefix_upper_bound(""), None);
    }

    #[test]
    fn upper_bound_skips_surrogates_and_carries() {
        assert_eq!(prefix_upper_bound("\u{D7FF}").as_deref(), Some("\u{E000}"));
        let max = char::MAX.to_string();
        assert_eq!(prefix_upper_bound(&format!("a{max}")).as_deref(), Some("b"));
        assert_eq!(prefix_upper_bound(&max), None);
    }

    #[test]
    fn plan_point_mode() {
        let query = ListQuery::plan(0, 5, "a", "ignored");
        assert_eq!(query, ListQuery::Point { key: "a" });
        let (sql, params) = query.to_sql();
        assert!(sql.contains("ORDER BY revision DESC LIMIT 1"));
        assert_eq!(params, vec![Value::Text("a".into())]);
    }

    #[test]
    fn plan_live_mode_ignores_resume_key() {
        let query = ListQuery::plan(-1, 10, "a/%", "a/b");
        assert_eq!(
            query,
            ListQuery::Live {
                pattern: KeyPattern::Prefix("a/"),
                limit: 11
            }
        );
        let (sql, params) = query.to_sql();
        assert!(!sql.contains("kvi.revision <= ?"));
        assert!(!sql.contains("kvi.name > ?"));
        assert_eq!(
            params,
            vec![Value::Text("a/".into()), Value::Text("a0".into()), Value::Integer(11)]
        );
    }

    #[test]
    fn plan_as_of_mode() {
        let query = ListQuery::plan(7, 0, "a/%", "");
        assert_eq!(
            query,
            ListQuery::AsOf {
                pattern: KeyPattern::Prefix("a/"),
                revision: 7,
                limit: SQL_UNBOUNDED_LIMIT
            }
        );
        assert_eq!(query.pinned_revision(), None);
        let (sql, params) = query.to_sql();
        assert!(sql.contains("kvi.revision <= ?"));
        assert_eq!(params.last(), Some(&Value::Integer(SQL_UNBOUNDED_LIMIT)));
    }

    #[test]
    fn plan_as_of_mode_with_exact_key() {
        let query = ListQuery::plan(7, 1, "a", "");
        let (sql, params) = query.to_sql();
        assert!(sql.contains("kvi.name = ?"));
        assert_eq!(params[0], Value::Text("a".into()));
        assert_eq!(params[1], Value::Integer(7));
    }

    #[test]
    fn plan_resume_mode_pins_revision() {
        let query = ListQuery::plan(9, 2, "%", "b");
        assert_eq!(query.pinned_revision(), Some(9));
        let (sql, params) = query.to_sql();
        assert!(sql.contains("kvi.name > ?"));
        // empty prefix has no upper bound
        assert_eq!(
            params,
            vec![
                Value::Text(String::new()),
                Value::Integer(9),
                Value::Text("b".into()),
                Value::Integer(3)
            ]
        );
    }

    #[test]
    fn placeholders_match_parameters() {
        for query in [
            ListQuery::plan(0, 0, "a", ""),
            ListQuery::plan(0, 3, "a%", ""),
            ListQuery::plan(4, 3, "a%", ""),
            ListQuery::plan(4, 3, "a%", "ab"),
        ] {
            let (sql, params) = query.to_sql();
            assert_eq!(sql.matches('?').count(), params.len(), "{query:?}");
        }
        let (sql, params) = ReplayQuery::new("a%", 3).to_sql();
        assert_eq!(sql.matches('?').count(), params.len());
    }

    #[test]
    fn replay_orders_by_revision() {
        let (sql, params) = ReplayQuery::new("a", 0).to_sql();
        assert!(sql.contains("kv.name = ?"));
        assert!(sql.ends_with("ORDER BY kv.revision ASC"));
        assert_eq!(params, vec![Value::Text("a".into()), Value::Integer(0)]);
    }
}
