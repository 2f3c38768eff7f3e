//! Validating parser for the restricted SQL grammar compiled rules must
//! emit. This is the ONLY thing that decides whether a rule's SQL is safe
//! to store and run — the LLM only fills template slots; it never gets to
//! approve its own output.

use std::collections::BTreeSet;

use serde_json::Value;

const ALLOWED_JOIN_TABLES: &[&str] = &["users", "credit_cards"];
const ALLOWED_AGGREGATES: &[&str] = &["sum", "avg", "median", "count"];
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant", "revoke",
    "merge", "call", "execute", "vacuum",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarViolation {
    NotSelectOnly,
    MultipleStatements,
    ContainsComment,
    MissingFromTransactions,
    DisallowedJoinTarget(String),
    ForbiddenKeyword(String),
    MissingUserIdFilter,
    MissingOccurredAtFilter,
    UnknownParam(String),
    DisallowedAggregate(String),
}

impl std::fmt::Display for GrammarViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrammarViolation::NotSelectOnly => write!(f, "sql must be a single SELECT statement"),
            GrammarViolation::MultipleStatements => write!(f, "sql must not contain ';'"),
            GrammarViolation::ContainsComment => write!(f, "sql must not contain comments"),
            GrammarViolation::MissingFromTransactions => {
                write!(f, "sql must select from the transactions table")
            }
            GrammarViolation::DisallowedJoinTarget(t) => {
                write!(f, "join target '{t}' is not allowed")
            }
            GrammarViolation::ForbiddenKeyword(k) => write!(f, "forbidden keyword '{k}' in sql"),
            GrammarViolation::MissingUserIdFilter => {
                write!(f, "sql where clause must filter on user_id = :user_id")
            }
            GrammarViolation::MissingOccurredAtFilter => {
                write!(f, "sql where clause must reference the occurred_at window")
            }
            GrammarViolation::UnknownParam(p) => {
                write!(f, "param ':{p}' is not declared in sql_params_schema")
            }
            GrammarViolation::DisallowedAggregate(a) => {
                write!(f, "aggregate function '{a}' is not allowed")
            }
        }
    }
}

/// Validate `sql` against the restricted grammar, returning every violation
/// found (not just the first) so compile failures can report complete hints.
pub fn validate(sql: &str, params_schema: &Value) -> Result<(), Vec<GrammarViolation>> {
    let mut violations = Vec::new();
    let lower = sql.to_ascii_lowercase();
    let trimmed = lower.trim();

    if !trimmed.starts_with("select") {
        violations.push(GrammarViolation::NotSelectOnly);
    }

    if sql.matches(';').count() > 0 {
        violations.push(GrammarViolation::MultipleStatements);
    }

    if lower.contains("--") || lower.contains("/*") {
        violations.push(GrammarViolation::ContainsComment);
    }

    if !lower.contains("from transactions") {
        violations.push(GrammarViolation::MissingFromTransactions);
    }

    for table in extract_join_targets(&lower) {
        if !ALLOWED_JOIN_TABLES.contains(&table.as_str()) {
            violations.push(GrammarViolation::DisallowedJoinTarget(table));
        }
    }

    for kw in FORBIDDEN_KEYWORDS {
        if contains_word(&lower, kw) {
            violations.push(GrammarViolation::ForbiddenKeyword((*kw).to_string()));
        }
    }

    for agg in extract_aggregate_calls(&lower) {
        if !ALLOWED_AGGREGATES.contains(&agg.as_str()) {
            violations.push(GrammarViolation::DisallowedAggregate(agg));
        }
    }

    if !lower.contains("user_id = :user_id") && !lower.contains("user_id=:user_id") {
        violations.push(GrammarViolation::MissingUserIdFilter);
    }

    if !lower.contains("occurred_at") {
        violations.push(GrammarViolation::MissingOccurredAtFilter);
    }

    let declared: BTreeSet<String> = params_schema
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    for param in extract_named_params(sql) {
        if param != "user_id" && !declared.contains(&param) {
            violations.push(GrammarViolation::UnknownParam(param));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.split(|c: char| !c.is_ascii_alphanumeric() && c != '_').any(|tok| tok == word)
}

fn extract_join_targets(lower_sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let tokens: Vec<&str> = lower_sql.split_whitespace().collect();
    for (i, tok) in tokens.iter().enumerate() {
        if *tok == "join" {
            if let Some(target) = tokens.get(i + 1) {
                out.push(target.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_').to_string());
            }
        }
    }
    out
}

fn extract_aggregate_calls(lower_sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = lower_sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c.is_ascii_alphabetic() {
            let start = i;
            let mut end = i + c.len_utf8();
            while let Some(&(j, cc)) = chars.peek() {
                if cc.is_ascii_alphanumeric() || cc == '_' {
                    end = j + cc.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let word = &lower_sql[start..end];
            if lower_sql[end..].trim_start().starts_with('(') && is_known_function_name(word) {
                out.push(word.to_string());
            }
        }
    }
    out
}

fn is_known_function_name(word: &str) -> bool {
    matches!(
        word,
        "sum" | "avg" | "median" | "count" | "min" | "max" | "stddev" | "variance"
    )
}

/// Extract every `:name` bound-parameter token from `sql`, in first-seen order.
pub fn extract_named_params(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' && i + 1 < bytes.len() && (bytes[i + 1] as char).is_ascii_alphabetic() {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            let name = sql[start..end].to_string();
            if !out.contains(&name) {
                out.push(name);
            }
            i = end;
        } else {
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_sql() -> &'static str {
        "select true as triggered, sum(amount) as observed, null::numeric as baseline, '{}'::jsonb as detail \
         from transactions where user_id = :user_id and occurred_at >= :window_start and occurred_at < :window_end"
    }

    #[test]
    fn accepts_well_formed_threshold_query() {
        let schema = json!({"window_start": "timestamp", "window_end": "timestamp"});
        assert!(validate(valid_sql(), &schema).is_ok());
    }

    #[test]
    fn rejects_semicolons() {
        let schema = json!({"window_start": "timestamp", "window_end": "timestamp"});
        let sql = format!("{};", valid_sql());
        let err = validate(&sql, &schema).unwrap_err();
        assert!(err.contains(&GrammarViolation::MultipleStatements));
    }

    #[test]
    fn rejects_non_select_statement() {
        let schema = json!({});
        let err = validate(
            "update transactions set amount = 0 where user_id = :user_id",
            &schema,
        )
        .unwrap_err();
        assert!(err.contains(&GrammarViolation::NotSelectOnly));
        assert!(err
            .iter()
            .any(|v| matches!(v, GrammarViolation::ForbiddenKeyword(k) if k == "update")));
    }

    #[test]
    fn rejects_comments() {
        let schema = json!({"window_start": "timestamp", "window_end": "timestamp"});
        let sql = format!("{} -- drop everything", valid_sql());
        let err = validate(&sql, &schema).unwrap_err();
        assert!(err.contains(&GrammarViolation::ContainsComment));
    }

    #[test]
    fn rejects_disallowed_join_target() {
        let schema = json!({"window_start": "timestamp", "window_end": "timestamp"});
        let sql = "select true as triggered from transactions join merchants on merchants.id = transactions.card_id where user_id = :user_id and occurred_at >= :window_start";
        let err = validate(sql, &schema).unwrap_err();
        assert!(err
            .iter()
            .any(|v| matches!(v, GrammarViolation::DisallowedJoinTarget(t) if t == "merchants")));
    }

    #[test]
    fn accepts_allowed_join_targets() {
        let schema = json!({"window_start": "timestamp"});
        let sql = "select true as triggered from transactions join users on users.id = transactions.user_id where user_id = :user_id and occurred_at >= :window_start";
        assert!(validate(sql, &schema).is_ok());
    }

    #[test]
    fn rejects_undeclared_param() {
        let schema = json!({"window_start": "timestamp"});
        let sql = "select true as triggered from transactions where user_id = :user_id and occurred_at >= :window_start and amount > :mystery";
        let err = validate(sql, &schema).unwrap_err();
        assert!(err
            .iter()
            .any(|v| matches!(v, GrammarViolation::UnknownParam(p) if p == "mystery")));
    }

    #[test]
    fn rejects_missing_user_id_filter() {
        let schema = json!({});
        let sql = "select true as triggered from transactions where occurred_at >= :window_start";
        let err = validate(sql, &schema).unwrap_err();
        assert!(err.contains(&GrammarViolation::MissingUserIdFilter));
    }

    #[test]
    fn rejects_disallowed_aggregate() {
        let schema = json!({"window_start": "timestamp"});
        let sql = "select stddev(amount) as observed from transactions where user_id = :user_id and occurred_at >= :window_start";
        let err = validate(sql, &schema).unwrap_err();
        assert!(err
            .iter()
            .any(|v| matches!(v, GrammarViolation::DisallowedAggregate(a) if a == "stddev")));
    }

    #[test]
    fn extract_named_params_dedupes_and_preserves_order() {
        let params = extract_named_params("where user_id = :user_id and occurred_at >= :a and occurred_at < :a");
        assert_eq!(params, vec!["user_id".to_string(), "a".to_string()]);
    }
}
