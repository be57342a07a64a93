//! Dry-run rewrites: a modifying statement → a read that counts the rows it
//! would touch.

use nlq_policy::statement::{find_top_level, lex, object_name_at, Token, TokenKind};

/// How to obtain the preview row count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreviewQuery {
    /// Run this `SELECT COUNT(*) AS preview_rows ...` in a read-only transaction.
    Count { sql: String, target: String },
    /// Known without touching the database (INSERT ... VALUES).
    Literal { rows: u64, target: String },
}

impl PreviewQuery {
    pub fn target(&self) -> &str {
        match self {
            PreviewQuery::Count { target, .. } | PreviewQuery::Literal { target, .. } => target,
        }
    }
}

/// Words that end a table alias position.
const ALIAS_STOP: [&str; 13] = [
    "WHERE", "USING", "RETURNING", "SET", "FROM", "ON", "WHEN", "AS", "SELECT", "VALUES", "DEFAULT", "WITH",
    "OVERRIDING",
];

pub fn rewrite(sql: &str) -> Result<PreviewQuery, String> {
    let tokens = lex(sql).map_err(|e| e.to_string())?;
    let first = tokens.first().ok_or("empty statement")?;
    match first.text.to_ascii_uppercase().as_str() {
        "DELETE" => rewrite_delete(sql, &tokens),
        "UPDATE" => rewrite_update(sql, &tokens),
        "INSERT" => rewrite_insert(sql, &tokens),
        "MERGE" => rewrite_merge(sql, &tokens),
        other => Err(format!("no dry-run rewrite for {other} statements")),
    }
}

/// Target text as written (schema kept), its alias (with a leading space, or
/// empty) and the token index after both.
fn target_at<'a>(sql: &'a str, tokens: &[Token<'a>], idx: usize) -> Result<(&'a str, String, usize), String> {
    let (_, after) = object_name_at(tokens, idx).ok_or("missing target table")?;
    let text = &sql[tokens[idx].start..tokens[after - 1].end];
    let mut i = after;
    if tokens.get(i).map(|t| t.is_word("AS")).unwrap_or(false) {
        i += 1;
    }
    let mut alias = String::new();
    if let Some(t) = tokens.get(i) {
        if matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent) && !t.is_any_word(&ALIAS_STOP) {
            alias = format!(" {}", t.text);
            i += 1;
        }
    }
    Ok((text, alias, i))
}

/// Source text between two token indices (end exclusive), trimmed.
fn span<'a>(sql: &'a str, tokens: &[Token<'a>], from: usize, to: usize) -> &'a str {
    if from >= to || from >= tokens.len() {
        return "";
    }
    let start = tokens[from].start;
    let end = tokens[to.min(tokens.len()) - 1].end;
    sql[start..end].trim()
}

/// End of an INSERT source: top-level `ON CONFLICT` or `RETURNING`.
fn insert_source_end(tokens: &[Token<'_>], from: usize) -> usize {
    let on_conflict = tokens
        .iter()
        .enumerate()
        .skip(from)
        .find(|(i, t)| {
            t.depth == 0 && t.is_word("ON") && tokens.get(i + 1).map(|n| n.is_word("CONFLICT")).unwrap_or(false)
        })
        .map(|(i, _)| i);
    let returning = find_top_level(tokens, "RETURNING", from);
    on_conflict.into_iter().chain(returning).min().unwrap_or(tokens.len())
}

fn count_sql(target: &str, alias: &str, from_list: Option<&str>, predicate: Option<&str>) -> String {
    let mut out = format!("SELECT COUNT(*) AS preview_rows FROM {target}{alias}");
    match (from_list, predicate) {
        (Some(list), Some(pred)) => out.push_str(&format!(" WHERE EXISTS (SELECT 1 FROM {list} WHERE {pred})")),
        (Some(list), None) => out.push_str(&format!(" WHERE EXISTS (SELECT 1 FROM {list})")),
        (None, Some(pred)) => out.push_str(&format!(" WHERE {pred}")),
        (None, None) => {}
    }
    out
}

fn rewrite_delete(sql: &str, tokens: &[Token<'_>]) -> Result<PreviewQuery, String> {
    if !tokens.get(1).map(|t| t.is_word("FROM")).unwrap_or(false) {
        return Err("expected DELETE FROM".into());
    }
    let idx = if tokens.get(2).map(|t| t.is_word("ONLY")).unwrap_or(false) { 3 } else { 2 };
    let (target, alias, after) = target_at(sql, tokens, idx)?;
    let returning = find_top_level(tokens, "RETURNING", after).unwrap_or(tokens.len());
    let where_at = find_top_level(tokens, "WHERE", after).filter(|w| *w < returning);
    let using = find_top_level(tokens, "USING", after).filter(|u| *u < returning);

    let using_list = using.map(|u| span(sql, tokens, u + 1, where_at.unwrap_or(returning)));
    let predicate = where_at.map(|w| span(sql, tokens, w + 1, returning));
    Ok(PreviewQuery::Count {
        sql: count_sql(target, &alias, using_list, predicate),
        target: target.to_string(),
    })
}

fn rewrite_update(sql: &str, tokens: &[Token<'_>]) -> Result<PreviewQuery, String> {
    let idx = if tokens.get(1).map(|t| t.is_word("ONLY")).unwrap_or(false) { 2 } else { 1 };
    let (target, alias, after) = target_at(sql, tokens, idx)?;
    let set = find_top_level(tokens, "SET", after).ok_or("expected SET")?;
    let returning = find_top_level(tokens, "RETURNING", set).unwrap_or(tokens.len());
    let where_at = find_top_level(tokens, "WHERE", set).filter(|w| *w < returning);
    let from = find_top_level(tokens, "FROM", set).filter(|f| *f < where_at.unwrap_or(returning));

    let from_list = from.map(|f| span(sql, tokens, f + 1, where_at.unwrap_or(returning)));
    let predicate = where_at.map(|w| span(sql, tokens, w + 1, returning));
    Ok(PreviewQuery::Count {
        sql: count_sql(target, &alias, from_list, predicate),
        target: target.to_string(),
    })
}

fn rewrite_insert(sql: &str, tokens: &[Token<'_>]) -> Result<PreviewQuery, String> {
    if !tokens.get(1).map(|t| t.is_word("INTO")).unwrap_or(false) {
        return Err("expected INSERT INTO".into());
    }
    let (target, _, mut i) = target_at(sql, tokens, 2)?;
    let target = target.to_string();
    // Optional column list.
    if tokens.get(i).map(|t| t.is_punct('(')).unwrap_or(false) {
        let depth = tokens[i].depth;
        i = tokens
            .iter()
            .enumerate()
            .skip(i + 1)
            .find(|(_, t)| t.is_punct(')') && t.depth == depth)
            .map(|(j, _)| j + 1)
            .ok_or("unbalanced column list")?;
    }
    // OVERRIDING { SYSTEM | USER } VALUE
    if tokens.get(i).map(|t| t.is_word("OVERRIDING")).unwrap_or(false) {
        i += 3;
    }
    let head = tokens.get(i).ok_or("missing INSERT source")?;
    let tail = insert_source_end(tokens, i + 1);

    if head.is_word("DEFAULT") {
        return Ok(PreviewQuery::Literal { rows: 1, target });
    }
    if head.is_word("VALUES") {
        let rows = tokens[i + 1..tail]
            .iter()
            .filter(|t| t.depth == 0 && t.is_punct('('))
            .count() as u64;
        return Ok(PreviewQuery::Literal { rows, target });
    }
    if head.is_any_word(&["SELECT", "WITH"]) || head.is_punct('(') {
        let source = span(sql, tokens, i, tail);
        return Ok(PreviewQuery::Count {
            sql: format!("SELECT COUNT(*) AS preview_rows FROM ({source}) AS preview_src"),
            target,
        });
    }
    Err(format!("unsupported INSERT source starting with {}", head.text))
}

fn rewrite_merge(sql: &str, tokens: &[Token<'_>]) -> Result<PreviewQuery, String> {
    if !tokens.get(1).map(|t| t.is_word("INTO")).unwrap_or(false) {
        return Err("expected MERGE INTO".into());
    }
    let (target, _, _) = target_at(sql, tokens, 2)?;
    Ok(PreviewQuery::Count {
        sql: format!("SELECT COUNT(*) AS preview_rows FROM {target}"),
        target: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(sql: &str) -> String {
        match rewrite(sql).unwrap() {
            PreviewQuery::Count { sql, .. } => sql,
            other => panic!("expected count query, got {other:?}"),
        }
    }

    #[test]
    fn delete_keeps_predicate() {
        assert_eq!(
            count("DELETE FROM billing.TEMP_LOAD t WHERE t.period = '2025-10' RETURNING id"),
            "SELECT COUNT(*) AS preview_rows FROM billing.TEMP_LOAD t WHERE t.period = '2025-10'"
        );
        assert_eq!(count("DELETE FROM TEMP_LOAD"), "SELECT COUNT(*) AS preview_rows FROM TEMP_LOAD");
    }

    #[test]
    fn delete_using_becomes_exists() {
        assert_eq!(
            count("DELETE FROM orders o USING clients c WHERE c.id = o.cid AND c.closed"),
            "SELECT COUNT(*) AS preview_rows FROM orders o WHERE EXISTS (SELECT 1 FROM clients c WHERE c.id = o.cid AND c.closed)"
        );
    }

    #[test]
    fn update_ignores_set_list() {
        assert_eq!(
            count("UPDATE TARIFF_EL SET rate = rate * 1.1, note = 'where' WHERE region IN (SELECT id FROM r)"),
            "SELECT COUNT(*) AS preview_rows FROM TARIFF_EL WHERE region IN (SELECT id FROM r)"
        );
        assert_eq!(
            count("UPDATE t AS x SET a = s.a FROM src s WHERE s.id = x.id"),
            "SELECT COUNT(*) AS preview_rows FROM t x WHERE EXISTS (SELECT 1 FROM src s WHERE s.id = x.id)"
        );
    }

    #[test]
    fn insert_values_counts_tuples() {
        let q = rewrite("INSERT INTO t (a, b) VALUES (1, 'x'), (2, '(y)'), (3, f(4)) ON CONFLICT DO NOTHING").unwrap();
        assert_eq!(q, PreviewQuery::Literal { rows: 3, target: "t".into() });
    }

    #[test]
    fn insert_select_counts_source() {
        assert_eq!(
            count("INSERT INTO archive (id) SELECT id FROM orders WHERE year < 2020 RETURNING id"),
            "SELECT COUNT(*) AS preview_rows FROM (SELECT id FROM orders WHERE year < 2020) AS preview_src"
        );
        assert_eq!(
            count("INSERT INTO x SELECT a.id FROM a JOIN b ON b.id = a.id ON CONFLICT DO NOTHING"),
            "SELECT COUNT(*) AS preview_rows FROM (SELECT a.id FROM a JOIN b ON b.id = a.id) AS preview_src"
        );
    }

    #[test]
    fn merge_counts_target() {
        let q = rewrite("MERGE INTO stock s USING delivery d ON s.id = d.id WHEN MATCHED THEN UPDATE SET qty = s.qty + d.qty").unwrap();
        assert_eq!(q.target(), "stock");
        assert_eq!(count("MERGE INTO stock s USING d ON s.id = d.id WHEN MATCHED THEN DELETE"), "SELECT COUNT(*) AS preview_rows FROM stock");
    }

    #[test]
    fn reads_have_no_rewrite() {
        assert!(rewrite("SELECT 1").is_err());
    }
}
