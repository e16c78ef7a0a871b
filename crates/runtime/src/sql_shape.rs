//! Token-level SQL analysis shared by the classifier and the optimizer.
//!
//! Nothing here builds an AST. The sqlparser tokenizer separates literals and
//! comments from code, which is all the heuristics need.

use sha2::{Digest, Sha256};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "COUNT",
    "SUM",
    "AVG",
    "MIN",
    "MAX",
    "STDDEV",
    "VARIANCE",
    "GROUP_CONCAT",
    "STRING_AGG",
    "ARRAY_AGG",
    "MEDIAN",
];

/// Simplified significant token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Word {
        /// Upper-cased value, for matching.
        upper: String,
        /// Normalized rendering: keywords upper, plain identifiers lower.
        text: String,
        quoted: bool,
    },
    Str(String),
    Num(String),
    Param(String),
    LParen,
    RParen,
    Comma,
    Period,
    Semi,
    Eq,
    Other(String),
}

impl Tok {
    fn is_word(&self, upper: &str) -> bool {
        matches!(self, Tok::Word { upper: u, quoted: false, .. } if u == upper)
    }

    fn is_value(&self) -> bool {
        matches!(self, Tok::Str(_) | Tok::Num(_) | Tok::Param(_))
    }

    fn render(&self, mask_literals: bool) -> String {
        match self {
            Tok::Word { text, .. } => text.clone(),
            Tok::Str(_) | Tok::Num(_) if mask_literals => "?".to_string(),
            Tok::Str(s) => s.clone(),
            Tok::Num(n) => n.clone(),
            Tok::Param(p) => p.clone(),
            Tok::LParen => "(".to_string(),
            Tok::RParen => ")".to_string(),
            Tok::Comma => ",".to_string(),
            Tok::Period => ".".to_string(),
            Tok::Semi => ";".to_string(),
            Tok::Eq => "=".to_string(),
            Tok::Other(s) => s.clone(),
        }
    }
}

fn is_string_literal(token: &Token) -> bool {
    matches!(
        token,
        Token::SingleQuotedString(_)
            | Token::DoubleQuotedString(_)
            | Token::NationalStringLiteral(_)
            | Token::EscapedStringLiteral(_)
            | Token::HexStringLiteral(_)
            | Token::DollarQuotedString(_)
    )
}

fn is_comment(token: &Token) -> bool {
    matches!(
        token,
        Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_))
    )
}

pub(crate) fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let dialect = GenericDialect {};
    Tokenizer::new(&dialect, sql)
        .tokenize()
        .map(|tokens| tokens.into_iter().filter(|t| *t != Token::EOF).collect())
        .map_err(|e| e.to_string())
}

fn simplify(token: &Token) -> Option<Tok> {
    let tok = match token {
        Token::Whitespace(_) | Token::EOF => return None,
        Token::Word(w) => {
            let quoted = w.quote_style.is_some();
            let text = if quoted {
                token.to_string()
            } else if w.keyword != Keyword::NoKeyword {
                w.value.to_ascii_uppercase()
            } else {
                w.value.to_ascii_lowercase()
            };
            Tok::Word {
                upper: w.value.to_ascii_uppercase(),
                text,
                quoted,
            }
        }
        Token::Number(_, _) => Tok::Num(token.to_string()),
        Token::Placeholder(p) => Tok::Param(p.clone()),
        Token::LParen => Tok::LParen,
        Token::RParen => Tok::RParen,
        Token::Comma => Tok::Comma,
        Token::Period => Tok::Period,
        Token::SemiColon => Tok::Semi,
        Token::Eq | Token::DoubleEq => Tok::Eq,
        t if is_string_literal(t) => Tok::Str(t.to_string()),
        other => Tok::Other(other.to_string()),
    };
    Some(tok)
}

/// Statement family, from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Transaction,
    Other,
}

/// Structural facts about one query text.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlShape {
    /// Canonical text with literals kept. Distinct literals give distinct keys.
    pub normalized: String,
    /// Canonical text with literals replaced by `?` (LIMIT values kept).
    pub fingerprint: String,
    pub statement: StatementKind,
    pub tables: Vec<String>,
    pub has_joins: bool,
    pub has_group_by: bool,
    pub has_aggregate_functions: bool,
    pub has_window_functions: bool,
    pub has_subqueries: bool,
    pub has_cte: bool,
    pub has_limit: bool,
    pub limit: Option<u64>,
    pub has_where: bool,
    pub has_order_by: bool,
    pub has_distinct: bool,
    pub has_set_operation: bool,
    /// `WHERE <id column> = <value>` with no other predicate.
    pub key_equality: bool,
    /// False when the tokenizer rejected the text.
    pub tokenized: bool,
}

impl SqlShape {
    pub fn has_aggregations(&self) -> bool {
        self.has_group_by || self.has_aggregate_functions
    }
}

pub fn analyze(sql: &str) -> SqlShape {
    match tokenize(sql) {
        Ok(tokens) => {
            let toks: Vec<Tok> = tokens.iter().filter_map(simplify).collect();
            analyze_tokens(&toks)
        }
        Err(e) => {
            tracing::debug!(target: "classifier", error = %e, "Tokenizer rejected query");
            let normalized = fallback_normalize(sql);
            SqlShape {
                fingerprint: normalized.clone(),
                normalized,
                statement: StatementKind::Other,
                tables: Vec::new(),
                has_joins: false,
                has_group_by: false,
                has_aggregate_functions: false,
                has_window_functions: false,
                has_subqueries: false,
                has_cte: false,
                has_limit: false,
                limit: None,
                has_where: false,
                has_order_by: false,
                has_distinct: false,
                has_set_operation: false,
                key_equality: false,
                tokenized: false,
            }
        }
    }
}

fn fallback_normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(';')
        .trim()
        .to_string()
}

fn analyze_tokens(toks: &[Tok]) -> SqlShape {
    let mut end = toks.len();
    while end > 0 && toks[end - 1] == Tok::Semi {
        end -= 1;
    }
    let toks = &toks[..end];

    let depths = paren_depths(toks);
    let statement = statement_kind(toks, &depths);
    let has_cte = toks.first().is_some_and(|t| t.is_word("WITH"));

    let mut has_joins = false;
    let mut has_group_by = false;
    let mut has_aggregate_functions = false;
    let mut has_window_functions = false;
    let mut has_subqueries = false;
    let mut has_limit = false;
    let mut limit = None;
    let mut has_where = false;
    let mut has_order_by = false;
    let mut has_distinct = false;
    let mut has_set_operation = false;

    for (i, tok) in toks.iter().enumerate() {
        let next = toks.get(i + 1);
        match tok {
            Tok::Word {
                upper,
                quoted: false,
                ..
            } => match upper.as_str() {
                "JOIN" => has_joins = true,
                "GROUP" if next.is_some_and(|n| n.is_word("BY")) => has_group_by = true,
                "ORDER" if next.is_some_and(|n| n.is_word("BY")) => has_order_by = true,
                "OVER" if matches!(next, Some(Tok::LParen) | Some(Tok::Word { .. })) => {
                    has_window_functions = true
                }
                "WHERE" => has_where = true,
                "DISTINCT" => has_distinct = true,
                "UNION" | "INTERSECT" | "EXCEPT" => has_set_operation = true,
                "LIMIT" | "FETCH" | "TOP" if depths[i] == 0 => {
                    has_limit = true;
                    limit = toks[i + 1..]
                        .iter()
                        .take(2)
                        .find_map(|t| match t {
                            Tok::Num(n) => n.parse::<u64>().ok(),
                            _ => None,
                        })
                        .or(limit);
                }
                name if AGGREGATE_FUNCTIONS.contains(&name) && next == Some(&Tok::LParen) => {
                    let windowed = matching_paren(toks, i + 1)
                        .and_then(|close| toks.get(close + 1))
                        .is_some_and(|t| t.is_word("OVER"));
                    if !windowed {
                        has_aggregate_functions = true;
                    }
                }
                _ => {}
            },
            Tok::LParen
                if next.is_some_and(|n| n.is_word("SELECT") || n.is_word("WITH")) =>
            {
                has_subqueries = true
            }
            _ => {}
        }
    }

    SqlShape {
        normalized: join(toks, false),
        fingerprint: fingerprint(toks),
        statement,
        tables: referenced_tables(toks, has_cte),
        has_joins,
        has_group_by,
        has_aggregate_functions,
        has_window_functions,
        has_subqueries,
        has_cte,
        has_limit,
        limit,
        has_where,
        has_order_by,
        has_distinct,
        has_set_operation,
        key_equality: key_equality(toks, &depths),
        tokenized: true,
    }
}

fn join(toks: &[Tok], mask_literals: bool) -> String {
    toks.iter()
        .map(|t| t.render(mask_literals))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Masked text that still keeps row counts, which change the routing.
fn fingerprint(toks: &[Tok]) -> String {
    let mut parts = Vec::with_capacity(toks.len());
    for (i, tok) in toks.iter().enumerate() {
        parts.push(tok.render(!is_row_count(toks, i)));
    }
    parts.join(" ")
}

/// `LIMIT n`, `TOP n` and `FETCH FIRST|NEXT n`.
fn is_row_count(toks: &[Tok], i: usize) -> bool {
    match i {
        0 => false,
        _ if toks[i - 1].is_word("LIMIT") || toks[i - 1].is_word("TOP") => true,
        1 => false,
        _ => {
            (toks[i - 1].is_word("FIRST") || toks[i - 1].is_word("NEXT"))
                && toks[i - 2].is_word("FETCH")
        }
    }
}

/// Paren depth at each token (the depth the token sits at).
fn paren_depths(toks: &[Tok]) -> Vec<usize> {
    let mut depth: usize = 0;
    toks.iter()
        .map(|t| match t {
            Tok::LParen => {
                let d = depth;
                depth += 1;
                d
            }
            Tok::RParen => {
                depth = depth.saturating_sub(1);
                depth
            }
            _ => depth,
        })
        .collect()
}

fn matching_paren(toks: &[Tok], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, tok) in toks.iter().enumerate().skip(open) {
        match tok {
            Tok::LParen => depth += 1,
            Tok::RParen => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn statement_kind(toks: &[Tok], depths: &[usize]) -> StatementKind {
    let leading = toks.iter().find_map(|t| match t {
        Tok::Word { upper, .. } => Some(upper.as_str()),
        _ => None,
    });
    match leading {
        Some("SELECT") | Some("VALUES") | Some("TABLE") => StatementKind::Select,
        Some("INSERT") | Some("REPLACE") | Some("UPSERT") | Some("MERGE") => StatementKind::Insert,
        Some("UPDATE") => StatementKind::Update,
        Some("DELETE") => StatementKind::Delete,
        Some("CREATE") | Some("ALTER") | Some("DROP") | Some("TRUNCATE") | Some("RENAME") => {
            StatementKind::Ddl
        }
        Some("BEGIN") | Some("COMMIT") | Some("ROLLBACK") | Some("START") | Some("SAVEPOINT")
        | Some("RELEASE") | Some("END") => StatementKind::Transaction,
        Some("WITH") => {
            // The statement after the CTE list decides.
            toks.iter()
                .zip(depths)
                .filter(|(_, d)| **d == 0)
                .find_map(|(t, _)| match t {
                    Tok::Word {
                        upper,
                        quoted: false,
                        ..
                    } => match upper.as_str() {
                        "SELECT" => Some(StatementKind::Select),
                        "INSERT" => Some(StatementKind::Insert),
                        "UPDATE" => Some(StatementKind::Update),
                        "DELETE" => Some(StatementKind::Delete),
                        _ => None,
                    },
                    _ => None,
                })
                .unwrap_or(StatementKind::Select)
        }
        _ => StatementKind::Other,
    }
}

fn word_name(tok: &Tok) -> Option<String> {
    match tok {
        Tok::Word { text, quoted, .. } => {
            if *quoted {
                Some(text.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']').to_lowercase())
            } else {
                Some(text.to_lowercase())
            }
        }
        _ => None,
    }
}

/// Parse `name(.name)*` at `i`. Returns the dotted name and the next index.
fn qualified_name(toks: &[Tok], mut i: usize) -> Option<(String, usize)> {
    let mut name = word_name(toks.get(i)?)?;
    i += 1;
    while toks.get(i) == Some(&Tok::Period) {
        match toks.get(i + 1).and_then(word_name) {
            Some(part) => {
                name.push('.');
                name.push_str(&part);
                i += 2;
            }
            None => break,
        }
    }
    Some((name, i))
}

fn is_clause_keyword(tok: &Tok) -> bool {
    match tok {
        Tok::Word {
            upper,
            quoted: false,
            ..
        } => matches!(
            upper.as_str(),
            "WHERE"
                | "GROUP"
                | "ORDER"
                | "LIMIT"
                | "HAVING"
                | "JOIN"
                | "INNER"
                | "LEFT"
                | "RIGHT"
                | "FULL"
                | "CROSS"
                | "OUTER"
                | "ON"
                | "USING"
                | "UNION"
                | "INTERSECT"
                | "EXCEPT"
                | "SET"
                | "VALUES"
                | "SELECT"
                | "WINDOW"
                | "NATURAL"
                | "OFFSET"
                | "FETCH"
                | "RETURNING"
        ),
        _ => false,
    }
}

fn referenced_tables(toks: &[Tok], has_cte: bool) -> Vec<String> {
    let cte_names: Vec<String> = if has_cte {
        toks.windows(3)
            .filter(|w| w[1].is_word("AS") && w[2] == Tok::LParen)
            .filter_map(|w| word_name(&w[0]))
            .collect()
    } else {
        Vec::new()
    };

    // Which open parens are subqueries: FROM inside EXTRACT(...) is not a table.
    let mut paren_is_query: Vec<bool> = Vec::new();
    let mut tables: Vec<String> = Vec::new();
    let push = |name: String, tables: &mut Vec<String>| {
        if !cte_names.contains(&name) && !tables.contains(&name) {
            tables.push(name);
        }
    };

    let mut i = 0;
    while i < toks.len() {
        match &toks[i] {
            Tok::LParen => {
                let is_query = toks
                    .get(i + 1)
                    .is_some_and(|n| n.is_word("SELECT") || n.is_word("WITH"));
                paren_is_query.push(is_query);
            }
            Tok::RParen => {
                paren_is_query.pop();
            }
            tok if tok.is_word("FROM")
                || tok.is_word("JOIN")
                || tok.is_word("INTO")
                || tok.is_word("UPDATE")
                || tok.is_word("TABLE") =>
            {
                let in_query = paren_is_query.last().copied().unwrap_or(true);
                if !in_query {
                    i += 1;
                    continue;
                }
                let is_from = tok.is_word("FROM");
                let mut j = i + 1;
                // CREATE TABLE IF NOT EXISTS t
                while toks.get(j).is_some_and(|t| {
                    t.is_word("IF") || t.is_word("NOT") || t.is_word("EXISTS") || t.is_word("ONLY")
                }) {
                    j += 1;
                }
                loop {
                    let Some((name, next)) = qualified_name(toks, j) else {
                        break;
                    };
                    if toks.get(j).is_some_and(is_clause_keyword) {
                        break;
                    }
                    push(name, &mut tables);
                    j = next;
                    if !is_from {
                        break;
                    }
                    // Optional alias, then a comma continues the FROM list.
                    if toks.get(j).is_some_and(|t| t.is_word("AS")) {
                        j += 1;
                    }
                    if toks.get(j).is_some_and(|t| {
                        matches!(t, Tok::Word { .. }) && !is_clause_keyword(t)
                    }) {
                        j += 1;
                    }
                    if toks.get(j) == Some(&Tok::Comma) {
                        j += 1;
                    } else {
                        break;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    tables
}

fn key_equality(toks: &[Tok], depths: &[usize]) -> bool {
    let Some(where_idx) = toks
        .iter()
        .zip(depths)
        .position(|(t, d)| *d == 0 && t.is_word("WHERE"))
    else {
        return false;
    };
    let Some((column, after)) = qualified_name(toks, where_idx + 1) else {
        return false;
    };
    let column = column.rsplit('.').next().unwrap_or_default().to_string();
    if column != "id" && !column.ends_with("_id") && column != "uuid" {
        return false;
    }
    if toks.get(after) != Some(&Tok::Eq) || !toks.get(after + 1).is_some_and(Tok::is_value) {
        return false;
    }
    match toks.get(after + 2) {
        None => true,
        Some(t) => t.is_word("LIMIT") || t.is_word("ORDER") || t.is_word("FOR"),
    }
}

/// Hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether the text parses as SQL with the generic dialect.
pub fn parses(sql: &str) -> bool {
    Parser::parse_sql(&GenericDialect {}, sql).is_ok()
}

/// Rendered SQL plus a same-length copy with literal and comment contents blanked.
///
/// Pattern rules search `masked`, so an anchor inside a string or a comment
/// never matches. Byte offsets are shared, so a match range in `masked` can be
/// sliced out of `rendered` to recover literal values.
#[derive(Debug, Clone)]
pub struct SqlText {
    pub rendered: String,
    pub masked: String,
}

impl SqlText {
    pub fn parse(sql: &str) -> Result<Self, String> {
        let tokens = tokenize(sql)?;
        let mut rendered = String::with_capacity(sql.len());
        let mut masked = String::with_capacity(sql.len());
        for token in &tokens {
            let text = token.to_string();
            if is_string_literal(token) {
                masked.push_str(&blank_literal(&text));
            } else if is_comment(token) {
                masked.push_str(&" ".repeat(text.len()));
            } else {
                masked.push_str(&text);
            }
            rendered.push_str(&text);
        }
        Ok(Self { rendered, masked })
    }

    /// Replace `range` (byte offsets valid in both texts) with `replacement`.
    pub fn splice(&self, range: std::ops::Range<usize>, replacement: &str) -> String {
        let mut out = String::with_capacity(self.rendered.len() + replacement.len());
        out.push_str(&self.rendered[..range.start]);
        out.push_str(replacement);
        out.push_str(&self.rendered[range.end..]);
        out
    }
}

fn blank_literal(text: &str) -> String {
    let len = text.len();
    if len < 2 {
        return "_".repeat(len);
    }
    let mut out = String::with_capacity(len);
    out.push('\'');
    out.push_str(&"_".repeat(len - 2));
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_ignores_case_whitespace_and_comments() {
        let a = analyze("select  *\nfrom Users -- trailing\n where id = 1;");
        let b = analyze("SELECT * FROM users WHERE id = 1");
        assert_eq!(a.normalized, b.normalized);
        assert_ne!(
            analyze("SELECT * FROM users WHERE id = 2").normalized,
            b.normalized
        );
        assert_eq!(
            analyze("SELECT * FROM users WHERE id = 2").fingerprint,
            b.fingerprint
        );
    }

    #[test]
    fn test_fingerprint_keeps_row_counts() {
        let ten = analyze("SELECT * FROM events FETCH FIRST 10 ROWS ONLY");
        let many = analyze("SELECT * FROM events FETCH FIRST 5000 ROWS ONLY");
        assert_ne!(ten.fingerprint, many.fingerprint);
        assert_eq!(ten.limit, Some(10));
        assert_ne!(
            analyze("SELECT * FROM events LIMIT 10").fingerprint,
            analyze("SELECT * FROM events LIMIT 11").fingerprint
        );
        assert_eq!(
            analyze("SELECT * FROM events WHERE id > 3 LIMIT 10").fingerprint,
            analyze("SELECT * FROM events WHERE id > 4 LIMIT 10").fingerprint
        );
    }

    #[test]
    fn test_structural_flags() {
        let shape = analyze(
            "WITH recent AS (SELECT * FROM orders) \
             SELECT c.region, SUM(r.total) FROM recent r JOIN customers c ON c.id = r.customer_id \
             GROUP BY c.region",
        );
        assert_eq!(shape.statement, StatementKind::Select);
        assert!(shape.has_cte);
        assert!(shape.has_joins);
        assert!(shape.has_group_by);
        assert!(shape.has_aggregate_functions);
        assert!(shape.has_subqueries);
        assert!(!shape.has_limit);
        assert_eq!(shape.tables, vec!["orders", "customers"]);
    }

    #[test]
    fn test_window_function_is_not_aggregation() {
        let shape =
            analyze("SELECT id, SUM(total) OVER (PARTITION BY region) FROM sales LIMIT 10");
        assert!(shape.has_window_functions);
        assert!(!shape.has_aggregate_functions);
        assert_eq!(shape.limit, Some(10));
    }

    #[test]
    fn test_extract_from_is_not_a_table() {
        let shape = analyze("SELECT EXTRACT(YEAR FROM created_at) FROM events, users u");
        assert_eq!(shape.tables, vec!["events", "users"]);
    }

    #[test]
    fn test_key_equality() {
        assert!(analyze("SELECT * FROM users WHERE id = ?").key_equality);
        assert!(analyze("SELECT name FROM users u WHERE u.user_id = 'x' LIMIT 1").key_equality);
        assert!(!analyze("SELECT * FROM users WHERE id = 1 OR id = 2").key_equality);
        assert!(!analyze("SELECT * FROM users WHERE name = 'a'").key_equality);
    }

    #[test]
    fn test_statement_kinds() {
        assert_eq!(analyze("INSERT INTO t VALUES (1)").statement, StatementKind::Insert);
        assert_eq!(analyze("update t set a = 1").statement, StatementKind::Update);
        assert_eq!(analyze("CREATE TABLE t (a INT)").statement, StatementKind::Ddl);
        assert_eq!(analyze("BEGIN").statement, StatementKind::Transaction);
        assert_eq!(analyze("INSERT INTO t VALUES (1)").tables, vec!["t"]);
    }

    #[test]
    fn test_untokenizable_falls_back() {
        let shape = analyze("SELECT 'unterminated");
        assert!(!shape.tokenized);
        assert_eq!(shape.normalized, "select 'unterminated");
    }

    #[test]
    fn test_masked_text_hides_literals_and_comments() {
        let text = SqlText::parse("SELECT 'WHERE 1=1' /* LIMIT */ FROM t").unwrap();
        assert_eq!(text.rendered.len(), text.masked.len());
        assert!(!text.masked.contains("WHERE"));
        assert!(!text.masked.contains("LIMIT"));
        assert!(text.rendered.contains("'WHERE 1=1'"));
    }
}
