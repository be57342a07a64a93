//! Statement-boundary recognizer.
//!
//! Two layers:
//! - [`lex`] tokenizes one SQL statement (quotes, comments, paren depth);
//! - [`extract_statement`] finds the first well-formed statement inside free
//!   model output (markdown fences, leading prose, trailing explanations,
//!   several alternative variants).

use nlq_types::StatementKind;
use thiserror::Error;

/// Keywords a generated statement may start with.
pub const LEADING_KEYWORDS: [&str; 5] = ["SELECT", "WITH", "INSERT", "UPDATE", "DELETE"];

const MODIFYING_KEYWORDS: [&str; 4] = ["INSERT", "UPDATE", "DELETE", "MERGE"];

/// A line ending in one of these cannot be the end of a statement.
const CONTINUATION_TAIL: [&str; 22] = [
    "UNION", "ALL", "INTERSECT", "EXCEPT", "MINUS", "AS", "AND", "OR", "ON", "WHERE", "FROM", "JOIN",
    "SELECT", "BY", "SET", "VALUES", "INTO", "WITH", "NOT", "IN", "HAVING", "USING",
];

/// Words that may open a SQL line; a capitalized word outside this set opens prose.
const SQL_LINE_WORDS: [&str; 48] = [
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "MERGE", "FROM", "WHERE", "JOIN", "LEFT", "RIGHT",
    "INNER", "OUTER", "FULL", "CROSS", "ON", "AND", "OR", "NOT", "GROUP", "ORDER", "HAVING", "LIMIT",
    "OFFSET", "FETCH", "UNION", "INTERSECT", "EXCEPT", "MINUS", "AS", "SET", "VALUES", "INTO", "RETURNING",
    "CASE", "WHEN", "THEN", "ELSE", "END", "IN", "EXISTS", "BETWEEN", "LIKE", "IS", "USING", "WINDOW",
    "PARTITION", "DISTINCT",
];

/// Functions whose argument syntax contains a bare `FROM`.
const FROM_FUNCTIONS: [&str; 5] = ["EXTRACT", "TRIM", "SUBSTRING", "OVERLAY", "POSITION"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Str,
    QuotedIdent,
    Number,
    Punct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
    /// Paren depth outside this token (`(` and its `)` share the outer depth).
    pub depth: u32,
}

impl Token<'_> {
    pub fn is_word(&self, kw: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(kw)
    }

    pub fn is_any_word(&self, kws: &[&str]) -> bool {
        kws.iter().any(|kw| self.is_word(kw))
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.starts_with(c)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated {what} starting at byte {at}")]
    Unterminated { what: &'static str, at: usize },
    #[error("unbalanced parentheses")]
    Unbalanced,
}

pub fn lex(sql: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut chars = sql.char_indices().peekable();
    let mut depth: u32 = 0;
    let mut out = Vec::new();

    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if sql[i..].starts_with("--") {
            while let Some(&(_, d)) = chars.peek() {
                if d == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }
        if sql[i..].starts_with("/*") {
            let Some(rel) = sql[i + 2..].find("*/") else {
                return Err(LexError::Unterminated { what: "comment", at: i });
            };
            let end = i + 2 + rel + 2;
            while let Some(&(j, _)) = chars.peek() {
                if j >= end {
                    break;
                }
                chars.next();
            }
            continue;
        }
        if c == '\'' || c == '"' {
            chars.next();
            let mut end = None;
            while let Some((j, d)) = chars.next() {
                if d == c {
                    if matches!(chars.peek(), Some(&(_, e)) if e == c) {
                        chars.next();
                        continue;
                    }
                    end = Some(j + 1);
                    break;
                }
            }
            let Some(end) = end else {
                let what = if c == '\'' { "string literal" } else { "quoted identifier" };
                return Err(LexError::Unterminated { what, at: i });
            };
            let kind = if c == '\'' { TokenKind::Str } else { TokenKind::QuotedIdent };
            out.push(Token { kind, text: &sql[i..end], start: i, end, depth });
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let mut end = i;
            while let Some(&(j, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' || d == '$' || d == '#' {
                    end = j + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Token { kind: TokenKind::Word, text: &sql[i..end], start: i, end, depth });
            continue;
        }
        if c.is_ascii_digit() {
            let mut end = i;
            while let Some(&(j, d)) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '.' {
                    end = j + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Token { kind: TokenKind::Number, text: &sql[i..end], start: i, end, depth });
            continue;
        }

        chars.next();
        let end = i + c.len_utf8();
        let token_depth = match c {
            '(' => {
                depth += 1;
                depth - 1
            }
            ')' => {
                if depth == 0 {
                    return Err(LexError::Unbalanced);
                }
                depth -= 1;
                depth
            }
            _ => depth,
        };
        out.push(Token { kind: TokenKind::Punct, text: &sql[i..end], start: i, end, depth: token_depth });
    }

    if depth != 0 {
        return Err(LexError::Unbalanced);
    }
    Ok(out)
}

/// First word of the statement, upper-cased.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let tokens = lex(sql).ok()?;
    tokens
        .first()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.text.to_ascii_uppercase())
}

/// INSERT/UPDATE/DELETE/MERGE lead ⇒ modifying. A WITH statement that
/// carries a data-modifying clause anywhere is modifying as well.
pub fn classify(sql: &str) -> StatementKind {
    let Ok(tokens) = lex(sql) else {
        return match first_word(sql) {
            Some(w) if MODIFYING_KEYWORDS.contains(&w.as_str()) => StatementKind::Modifying,
            _ => StatementKind::Read,
        };
    };
    let Some(first) = tokens.first() else {
        return StatementKind::Read;
    };
    if first.is_any_word(&MODIFYING_KEYWORDS) {
        return StatementKind::Modifying;
    }
    if first.is_word("WITH") && tokens.iter().skip(1).any(|t| t.is_any_word(&MODIFYING_KEYWORDS)) {
        return StatementKind::Modifying;
    }
    StatementKind::Read
}

fn first_word(sql: &str) -> Option<String> {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
}

/// Number of non-empty statements separated by top-level `;`.
pub fn statement_count(sql: &str) -> Result<usize, LexError> {
    let tokens = lex(sql)?;
    let mut count = 0;
    let mut in_statement = false;
    for t in &tokens {
        if t.is_punct(';') && t.depth == 0 {
            if in_statement {
                count += 1;
            }
            in_statement = false;
        } else {
            in_statement = true;
        }
    }
    if in_statement {
        count += 1;
    }
    Ok(count)
}

/// Remove trailing `;` terminators and whitespace.
pub fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Index of the first top-level word `kw` at or after `from`.
pub fn find_top_level(tokens: &[Token<'_>], kw: &str, from: usize) -> Option<usize> {
    tokens
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, t)| t.depth == 0 && t.is_word(kw))
        .map(|(i, _)| i)
}

/// Reads a possibly schema-qualified name starting at `idx`.
/// Returns the last name segment (unquoted, upper-cased) and the index after it.
pub fn object_name_at(tokens: &[Token<'_>], idx: usize) -> Option<(String, usize)> {
    let mut i = idx;
    let mut last: Option<String> = None;
    loop {
        let t = tokens.get(i)?;
        match t.kind {
            TokenKind::Word => last = Some(t.text.to_ascii_uppercase()),
            TokenKind::QuotedIdent => last = Some(t.text.trim_matches('"').replace("\"\"", "\"")),
            _ => return None,
        }
        i += 1;
        match tokens.get(i) {
            Some(dot) if dot.is_punct('.') => i += 1,
            _ => break,
        }
    }
    last.map(|name| (name, i))
}

/// Object names following FROM / JOIN / INTO, excluding CTE names, subqueries
/// and `FROM` inside EXTRACT/TRIM-style functions. Upper-cased, first-seen order.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let Ok(tokens) = lex(sql) else {
        return Vec::new();
    };
    let ctes = cte_names(&tokens);
    let mut out: Vec<String> = Vec::new();
    let push = |name: String, out: &mut Vec<String>| {
        if !ctes.contains(&name) && !out.contains(&name) {
            out.push(name);
        }
    };

    // Word immediately before each open paren, indexed by depth.
    let mut openers: Vec<Option<String>> = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        if t.is_punct('(') {
            let prev = i
                .checked_sub(1)
                .and_then(|p| tokens.get(p))
                .filter(|p| p.kind == TokenKind::Word)
                .map(|p| p.text.to_ascii_uppercase());
            openers.truncate(t.depth as usize);
            openers.push(prev);
            continue;
        }
        if !t.is_any_word(&["FROM", "JOIN", "INTO"]) {
            continue;
        }
        if t.is_word("FROM") && t.depth > 0 {
            let inside = openers.get(t.depth as usize - 1).cloned().flatten();
            if inside.map(|f| FROM_FUNCTIONS.contains(&f.as_str())).unwrap_or(false) {
                continue;
            }
        }

        let mut j = i + 1;
        while tokens.get(j).map(|n| n.is_any_word(&["ONLY", "LATERAL"])).unwrap_or(false) {
            j += 1;
        }
        let Some((name, mut next)) = object_name_at(&tokens, j) else {
            continue;
        };
        push(name, &mut out);

        // Comma-separated FROM lists: `FROM a x, b y`.
        if t.is_word("FROM") {
            loop {
                while tokens
                    .get(next)
                    .map(|n| n.kind == TokenKind::Word && !is_clause_word(n) || n.is_word("AS"))
                    .unwrap_or(false)
                {
                    next += 1;
                }
                match tokens.get(next) {
                    Some(c) if c.is_punct(',') && c.depth == t.depth => {
                        match object_name_at(&tokens, next + 1) {
                            Some((name, after)) => {
                                push(name, &mut out);
                                next = after;
                            }
                            None => break,
                        }
                    }
                    _ => break,
                }
            }
        }
    }
    out
}

fn is_clause_word(t: &Token<'_>) -> bool {
    t.is_any_word(&[
        "WHERE", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "FULL", "CROSS", "NATURAL", "ON", "GROUP",
        "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "INTERSECT", "EXCEPT", "MINUS", "WINDOW",
        "RETURNING", "SET", "USING", "FOR", "SELECT", "VALUES", "WHEN",
    ])
}

fn cte_names(tokens: &[Token<'_>]) -> Vec<String> {
    let mut names = Vec::new();
    if !tokens.first().map(|t| t.is_word("WITH")).unwrap_or(false) {
        return names;
    }
    for (i, t) in tokens.iter().enumerate() {
        if t.depth != 0 || t.kind != TokenKind::Word {
            continue;
        }
        let prev_ok = i == 1
            || tokens
                .get(i.wrapping_sub(1))
                .map(|p| p.is_punct(',') && p.depth == 0 || p.is_word("RECURSIVE"))
                .unwrap_or(false);
        let next_is_as = tokens.get(i + 1).map(|n| n.is_word("AS")).unwrap_or(false);
        let next_is_cols = tokens.get(i + 1).map(|n| n.is_punct('(')).unwrap_or(false);
        if prev_ok && (next_is_as || next_is_cols) {
            names.push(t.text.to_ascii_uppercase());
        }
    }
    names
}

/// Find the first well-formed statement in free-form model output.
///
/// Leading prose and markdown fences are dropped, the statement ends at a
/// top-level `;`, a closing fence, a prose line, or the start of a second
/// statement; the terminator is not included.
pub fn extract_statement(raw: &str) -> Option<String> {
    for start in candidate_starts(raw) {
        let Some(end) = scan_statement(raw, start) else {
            continue;
        };
        let stmt = strip_terminator(&raw[start..end]);
        if is_well_formed(stmt) {
            return Some(stmt.to_string());
        }
    }
    None
}

/// Offsets of leading keywords that are upper-case or begin a line.
fn candidate_starts(raw: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut prev: Option<char> = None;
    for (i, c) in raw.char_indices() {
        let boundary = prev.map(|p| !(p.is_alphanumeric() || p == '_')).unwrap_or(true);
        prev = Some(c);
        if !boundary || !c.is_ascii_alphabetic() {
            continue;
        }
        let word: &str = raw[i..]
            .split(|d: char| !(d.is_alphanumeric() || d == '_'))
            .next()
            .unwrap_or("");
        if !LEADING_KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw)) {
            continue;
        }
        let line_start = raw[..i].rfind('\n').map(|n| n + 1).unwrap_or(0);
        let at_line_start = raw[line_start..i].trim_matches(|c: char| c.is_whitespace() || c == '`').is_empty();
        let upper = word.chars().all(|c| c.is_ascii_uppercase());
        if at_line_start || upper {
            out.push(i);
        }
    }
    out
}

fn scan_statement(raw: &str, start: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut line_comment = false;
    let mut block_comment = false;
    let mut iter = raw[start..].char_indices().peekable();

    while let Some((off, c)) = iter.next() {
        let abs = start + off;
        if line_comment {
            if c != '\n' {
                continue;
            }
            line_comment = false;
        } else if block_comment {
            if raw[abs..].starts_with("*/") {
                iter.next();
                block_comment = false;
            }
            continue;
        } else if let Some(q) = quote {
            if c == q {
                if matches!(iter.peek(), Some(&(_, n)) if n == q) {
                    iter.next();
                } else {
                    quote = None;
                }
            }
            continue;
        } else {
            match c {
                '\'' | '"' => {
                    quote = Some(c);
                    continue;
                }
                '-' if raw[abs..].starts_with("--") => {
                    line_comment = true;
                    continue;
                }
                '/' if raw[abs..].starts_with("/*") => {
                    block_comment = true;
                    iter.next();
                    continue;
                }
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return Some(abs);
                    }
                }
                ';' | '`' if depth == 0 => return Some(abs),
                _ => {}
            }
        }

        if c == '\n' && depth == 0 {
            let rest = &raw[abs + 1..];
            if let Some(next_line) = rest.lines().map(str::trim).find(|l| !l.is_empty()) {
                if next_line.starts_with("```") || is_prose_line(next_line) {
                    return Some(abs);
                }
                if starts_statement(next_line) && statement_complete(&raw[start..abs]) {
                    return Some(abs);
                }
            }
        }
    }

    if quote.is_some() || block_comment || depth != 0 {
        None
    } else {
        Some(raw.len())
    }
}

fn starts_statement(line: &str) -> bool {
    first_word(line)
        .map(|w| LEADING_KEYWORDS.contains(&w.as_str()))
        .unwrap_or(false)
}

fn statement_complete(partial: &str) -> bool {
    let Ok(tokens) = lex(partial) else {
        return false;
    };
    let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
        return false;
    };
    if last.is_any_word(&CONTINUATION_TAIL) || last.is_punct(',') || last.is_punct('(') {
        return false;
    }
    let main_after = |kws: &[&str]| tokens.iter().skip(1).any(|t| t.depth == 0 && t.is_any_word(kws));
    if first.is_word("WITH") {
        return main_after(&["SELECT", "INSERT", "UPDATE", "DELETE"]);
    }
    if first.is_word("INSERT") {
        return main_after(&["SELECT", "VALUES"]);
    }
    true
}

fn is_prose_line(line: &str) -> bool {
    if line.starts_with("--") {
        return false;
    }
    if line.starts_with('#') || line.starts_with("- ") || line.starts_with("* ") || line.starts_with("• ") {
        return true;
    }
    if line.ends_with(':') {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if (rest.starts_with(". ") || rest.starts_with(") ")) && !rest[2..].trim_start().starts_with(',') {
            return true;
        }
    }
    let Some(first) = line.chars().next() else {
        return false;
    };
    if first.is_alphabetic() && !first.is_ascii() {
        return true;
    }
    let word: String = line.chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    if word.is_empty() {
        return false;
    }
    let capitalized = first.is_uppercase() && word.chars().skip(1).any(|c| c.is_lowercase());
    capitalized && !SQL_LINE_WORDS.contains(&word.to_ascii_uppercase().as_str())
}

/// Structural sanity of one extracted statement.
pub fn is_well_formed(stmt: &str) -> bool {
    let Ok(tokens) = lex(stmt) else {
        return false;
    };
    if tokens.len() < 2 || tokens.iter().any(|t| t.is_punct(';')) {
        return false;
    }
    let first = tokens[0];
    if !first.is_any_word(&LEADING_KEYWORDS) {
        return false;
    }
    let has_top = |kw: &str| find_top_level(&tokens, kw, 1).is_some();
    if first.is_word("WITH") {
        ["SELECT", "INSERT", "UPDATE", "DELETE"].iter().any(|kw| has_top(kw))
    } else if first.is_word("INSERT") {
        has_top("INTO")
    } else if first.is_word("UPDATE") {
        has_top("SET")
    } else if first.is_word("DELETE") {
        has_top("FROM")
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexer_tracks_depth_and_quotes() {
        let tokens = lex("SELECT 'a;b', (1) FROM t -- c;\n/* x */").unwrap();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["SELECT", "'a;b'", ",", "(", "1", ")", "FROM", "t"]);
        assert_eq!(tokens[4].depth, 1);
        assert_eq!(tokens[5].depth, 0);
        assert!(matches!(lex("SELECT 'open"), Err(LexError::Unterminated { .. })));
        assert_eq!(lex("SELECT (1"), Err(LexError::Unbalanced));
    }

    #[test]
    fn escaped_quote_stays_inside_literal() {
        assert_eq!(statement_count("SELECT 'it''s; fine' FROM t").unwrap(), 1);
        assert_eq!(statement_count("SELECT 1 FROM a; SELECT 2 FROM b;").unwrap(), 2);
        assert_eq!(statement_count("SELECT 1 FROM a;;").unwrap(), 1);
    }

    #[test]
    fn classify_by_leading_keyword() {
        assert_eq!(classify("DELETE FROM TARIFF_EL WHERE TARIFF_ID = 5"), StatementKind::Modifying);
        assert_eq!(classify("merge into t using s on (t.id = s.id)"), StatementKind::Modifying);
        assert_eq!(classify("SELECT * FROM t"), StatementKind::Read);
        assert_eq!(classify("WITH a AS (SELECT 1) SELECT * FROM a"), StatementKind::Read);
        assert_eq!(
            classify("WITH gone AS (DELETE FROM t RETURNING *) SELECT count(*) FROM gone"),
            StatementKind::Modifying
        );
        assert_eq!(classify("SELECT 'DELETE' FROM t"), StatementKind::Read);
    }

    #[test]
    fn extracts_from_fenced_output_with_prose() {
        let raw = "Here's the query you asked for:\n```sql\nSELECT c.name\nFROM CLIENTS c\nWHERE c.active = 1;\n```\nThis query lists active clients.";
        assert_eq!(
            extract_statement(raw).as_deref(),
            Some("SELECT c.name\nFROM CLIENTS c\nWHERE c.active = 1")
        );
    }

    #[test]
    fn keeps_only_first_variant() {
        let raw = "Variant 1:\nSELECT * FROM A\n\nVariant 2:\nSELECT * FROM B";
        assert_eq!(extract_statement(raw).as_deref(), Some("SELECT * FROM A"));

        let raw = "SELECT * FROM A\nSELECT * FROM B";
        assert_eq!(extract_statement(raw).as_deref(), Some("SELECT * FROM A"));

        let raw = "1. SELECT * FROM A;\n2. SELECT * FROM B;";
        assert_eq!(extract_statement(raw).as_deref(), Some("SELECT * FROM A"));
    }

    #[test]
    fn union_and_cte_lines_are_continuations() {
        let raw = "SELECT a FROM x\nUNION ALL\nSELECT a FROM y";
        assert_eq!(extract_statement(raw).as_deref(), Some(raw));

        let raw = "WITH m AS (\n  SELECT 1 AS v\n)\nSELECT v FROM m";
        assert_eq!(extract_statement(raw).as_deref(), Some(raw));

        let raw = "INSERT INTO t (a)\nSELECT a FROM s";
        assert_eq!(extract_statement(raw).as_deref(), Some(raw));
    }

    #[test]
    fn russian_explanation_is_dropped() {
        let raw = "SELECT * FROM V_UNPROFITABLE_CUSTOMERS\nWHERE PERIOD = '2025-10'\nЭтот запрос возвращает убыточных клиентов.";
        assert_eq!(
            extract_statement(raw).as_deref(),
            Some("SELECT * FROM V_UNPROFITABLE_CUSTOMERS\nWHERE PERIOD = '2025-10'")
        );
    }

    #[test]
    fn prose_only_yields_nothing() {
        assert_eq!(extract_statement("I cannot answer that question."), None);
        assert_eq!(extract_statement(""), None);
        assert_eq!(extract_statement("```sql\nSELECT 'unterminated\n```"), None);
    }

    #[test]
    fn lowercase_keyword_inside_prose_is_not_a_start() {
        let raw = "You can select rows like this: SELECT id FROM t";
        assert_eq!(extract_statement(raw).as_deref(), Some("SELECT id FROM t"));
    }

    #[test]
    fn referenced_tables_skip_ctes_and_functions() {
        let sql = "WITH m AS (SELECT * FROM sales.ORDERS o) \
                   SELECT EXTRACT(YEAR FROM m.dt), c.name FROM m, TARIFF_EL t JOIN CLIENTS c ON c.id = m.cid \
                   WHERE EXISTS (SELECT 1 FROM \"Payments\" p)";
        assert_eq!(referenced_tables(sql), vec!["ORDERS", "TARIFF_EL", "CLIENTS", "Payments"]);
        assert_eq!(referenced_tables("INSERT INTO audit_log SELECT * FROM events"), vec!["AUDIT_LOG", "EVENTS"]);
    }

    #[test]
    fn strip_terminator_removes_trailing_semicolons() {
        assert_eq!(strip_terminator("  SELECT 1 ;; \n"), "SELECT 1");
    }
}
