//! Built-in rewrite rules.
//!
//! Every rule matches against [`SqlText::masked`], so text inside string
//! literals and comments is never an anchor. Rules return `Ok(None)` when the
//! pattern is absent.

use regex::{Captures, Regex};

use sluice_common::models::QueryMetadata;

use crate::sql_shape::SqlText;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rule pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
    #[error("{0}")]
    Rewrite(String),
}

/// Inputs a rule may consult besides the text.
pub struct RuleContext<'a> {
    pub metadata: &'a QueryMetadata,
    pub default_limit: u64,
    pub limit_row_threshold: u64,
}

pub trait RewriteRule: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> u32;

    /// Applicability conditions checked before the pattern.
    fn applies_to(&self, _ctx: &RuleContext<'_>) -> bool {
        true
    }

    fn rewrite(&self, sql: &SqlText, ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError>;
}

/// Replace every match of `re` in the masked text, building the output from
/// the rendered text. `replace` returns `None` to leave a match untouched.
fn replace_masked<F>(text: &SqlText, re: &Regex, mut replace: F) -> Option<String>
where
    F: FnMut(&Captures<'_>, &str) -> Option<String>,
{
    let mut out = String::with_capacity(text.rendered.len());
    let mut last = 0;
    let mut changed = false;
    for caps in re.captures_iter(&text.masked) {
        let Some(whole) = caps.get(0) else { continue };
        if let Some(replacement) = replace(&caps, &text.rendered) {
            out.push_str(&text.rendered[last..whole.start()]);
            out.push_str(&replacement);
            last = whole.end();
            changed = true;
        }
    }
    if !changed {
        return None;
    }
    out.push_str(&text.rendered[last..]);
    Some(out)
}

/// Slice of `rendered` covered by capture group `i`.
fn group<'a>(caps: &Captures<'_>, rendered: &'a str, i: usize) -> &'a str {
    caps.get(i).map_or("", |m| &rendered[m.range()])
}

fn group_named<'a>(caps: &Captures<'_>, rendered: &'a str, name: &str) -> Option<&'a str> {
    caps.name(name).map(|m| &rendered[m.range()])
}

/// Rendered text without trailing whitespace, semicolons or comments.
fn trimmed_end(text: &SqlText) -> &str {
    let end = text
        .masked
        .trim_end_matches(|c: char| c.is_whitespace() || c == ';')
        .len();
    &text.rendered[..end]
}

pub struct StripTrailingSemicolonRule {
    pattern: Regex,
}

impl StripTrailingSemicolonRule {
    pub fn new() -> Result<Self, RuleError> {
        Ok(Self {
            pattern: Regex::new(r";[\s;]*$")?,
        })
    }
}

impl RewriteRule for StripTrailingSemicolonRule {
    fn name(&self) -> &str {
        "strip_trailing_semicolon"
    }

    fn description(&self) -> &str {
        "Drop the statement terminator so later rules can append clauses"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn rewrite(&self, sql: &SqlText, _ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError> {
        let Some(m) = self.pattern.find(&sql.masked) else {
            return Ok(None);
        };
        // Multi-statement batches are left alone.
        if sql.masked[..m.start()].contains(';') {
            return Ok(None);
        }
        Ok(Some(sql.rendered[..m.start()].trim_end().to_string()))
    }
}

pub struct RemoveTautologyRule {
    leading: Regex,
    trailing: Regex,
    sole: Regex,
}

impl RemoveTautologyRule {
    pub fn new() -> Result<Self, RuleError> {
        Ok(Self {
            // WHERE 1=1 AND x  ->  WHERE x
            leading: Regex::new(r"(?i)\bWHERE\s+1\s*=\s*1\s+AND\s+")?,
            // x AND 1=1  ->  x, only when 1=1 is a complete conjunct
            trailing: Regex::new(
                r"(?i)\s+AND\s+1\s*=\s*1(\s*\)|\s*$|\s+(?:AND|OR|GROUP|ORDER|LIMIT|HAVING|UNION)\b)",
            )?,
            // WHERE 1=1 with nothing else
            sole: Regex::new(
                r"(?i)\s+WHERE\s+1\s*=\s*1(\s*\)|\s*$|\s+(?:GROUP|ORDER|LIMIT|HAVING|UNION)\b)",
            )?,
        })
    }
}

impl RewriteRule for RemoveTautologyRule {
    fn name(&self) -> &str {
        "remove_tautology"
    }

    fn description(&self) -> &str {
        "Remove always-true 1=1 predicates"
    }

    fn priority(&self) -> u32 {
        90
    }

    fn applies_to(&self, ctx: &RuleContext<'_>) -> bool {
        !ctx.metadata.category.is_write()
    }

    fn rewrite(&self, sql: &SqlText, _ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError> {
        let mut current: Option<String> = None;
        for (idx, pattern) in [&self.leading, &self.trailing, &self.sole].into_iter().enumerate() {
            let text = match &current {
                Some(sql) => SqlText::parse(sql).map_err(RuleError::Rewrite)?,
                None => sql.clone(),
            };
            let replaced = replace_masked(&text, pattern, |caps, rendered| {
                Some(match idx {
                    0 => "WHERE ".to_string(),
                    _ => group(caps, rendered, 1).to_string(),
                })
            });
            if replaced.is_some() {
                current = replaced;
            }
        }
        Ok(current)
    }
}

pub struct CountOneToCountStarRule {
    pattern: Regex,
}

impl CountOneToCountStarRule {
    pub fn new() -> Result<Self, RuleError> {
        Ok(Self {
            pattern: Regex::new(r"(?i)\bCOUNT\s*\(\s*1\s*\)")?,
        })
    }
}

impl RewriteRule for CountOneToCountStarRule {
    fn name(&self) -> &str {
        "count_one_to_count_star"
    }

    fn description(&self) -> &str {
        "Rewrite COUNT(1) as COUNT(*)"
    }

    fn priority(&self) -> u32 {
        80
    }

    fn applies_to(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.metadata.has_aggregations
    }

    fn rewrite(&self, sql: &SqlText, _ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError> {
        Ok(replace_masked(sql, &self.pattern, |_, _| {
            Some("COUNT(*)".to_string())
        }))
    }
}

const IDENT: &str = r"[A-Za-z_][A-Za-z0-9_.]*";
const VALUE: &str = r"'_*'|-?\d+(?:\.\d+)?";

pub struct OrChainToInRule {
    chain: Regex,
    link: Regex,
}

impl OrChainToInRule {
    pub fn new() -> Result<Self, RuleError> {
        // The chain must be the whole WHERE predicate or the whole content of
        // a parenthesized group, otherwise AND binding would change meaning.
        let chain = format!(
            r"(?i)(\bWHERE\s+|\(\s*)({ident})\s*=\s*({value})((?:\s+OR\s+{ident}\s*=\s*(?:{value}))+)(\s*\)|\s*$|\s+(?:GROUP|ORDER|LIMIT|HAVING|UNION)\b)",
            ident = IDENT,
            value = VALUE
        );
        let link = format!(
            r"(?i)\s+OR\s+({ident})\s*=\s*({value})",
            ident = IDENT,
            value = VALUE
        );
        Ok(Self {
            chain: Regex::new(&chain)?,
            link: Regex::new(&link)?,
        })
    }
}

impl RewriteRule for OrChainToInRule {
    fn name(&self) -> &str {
        "or_chain_to_in"
    }

    fn description(&self) -> &str {
        "Collapse `c = a OR c = b` on one column into `c IN (a, b)`"
    }

    fn priority(&self) -> u32 {
        70
    }

    fn rewrite(&self, sql: &SqlText, _ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError> {
        Ok(replace_masked(sql, &self.chain, |caps, rendered| {
            let column = group(caps, rendered, 2);
            let mut values = vec![group(caps, rendered, 3).to_string()];

            let tail = caps.get(4)?;
            for link in self.link.captures_iter(&sql.masked[tail.range()]) {
                let col = link.get(1)?;
                let value = link.get(2)?;
                let col_text = &rendered[tail.start() + col.start()..tail.start() + col.end()];
                if !col_text.eq_ignore_ascii_case(column) {
                    return None;
                }
                values.push(rendered[tail.start() + value.start()..tail.start() + value.end()].to_string());
            }

            Some(format!(
                "{}{} IN ({}){}",
                group(caps, rendered, 1),
                column,
                values.join(", "),
                group(caps, rendered, 5)
            ))
        }))
    }
}

pub struct InSubqueryToJoinRule {
    pattern: Regex,
    word: Regex,
}

/// Words allowed unqualified in the subquery's WHERE clause.
const PREDICATE_KEYWORDS: &[&str] = &[
    "where", "and", "or", "not", "is", "null", "like", "between", "true", "false", "escape",
];

impl InSubqueryToJoinRule {
    pub fn new() -> Result<Self, RuleError> {
        let pattern = format!(
            r"(?is)^\s*SELECT\s+(?P<cols>.+?)\s+FROM\s+(?P<table>[A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:AS\s+)?(?P<alias>[A-Za-z_][A-Za-z0-9_]*))?\s+WHERE\s+(?P<col>{ident})\s+IN\s*\(\s*SELECT\s+(?P<inner_col>{ident})\s+FROM\s+(?P<inner_table>[A-Za-z_][A-Za-z0-9_]*)(?P<inner_where>\s+WHERE\s+[^()]*?)?\s*\)\s*$",
            ident = IDENT
        );
        Ok(Self {
            pattern: Regex::new(&pattern)?,
            word: Regex::new(r"\b[A-Za-z][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?")?,
        })
    }

    /// Whether every column in the masked WHERE text is qualified with the
    /// subquery's own table. A bare name may resolve to the outer query,
    /// which goes out of scope once the subquery becomes a derived table.
    fn refs_stay_inside(&self, masked_where: &str, inner_table: &str) -> bool {
        self.word.find_iter(masked_where).all(|m| {
            let word = m.as_str();
            match word.split_once('.') {
                Some((qualifier, _)) => qualifier.eq_ignore_ascii_case(inner_table),
                None => PREDICATE_KEYWORDS
                    .iter()
                    .any(|kw| word.eq_ignore_ascii_case(kw)),
            }
        })
    }
}

impl RewriteRule for InSubqueryToJoinRule {
    fn name(&self) -> &str {
        "in_subquery_to_join"
    }

    fn description(&self) -> &str {
        "Turn `c IN (SELECT ...)` into a join against a DISTINCT derived table"
    }

    fn priority(&self) -> u32 {
        60
    }

    fn applies_to(&self, ctx: &RuleContext<'_>) -> bool {
        ctx.metadata.has_subqueries && !ctx.metadata.category.is_write()
    }

    fn rewrite(&self, sql: &SqlText, _ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError> {
        let body = trimmed_end(sql);
        let masked = &sql.masked[..body.len()];
        let Some(caps) = self.pattern.captures(masked) else {
            return Ok(None);
        };
        let Some(cols) = group_named(&caps, body, "cols") else {
            return Ok(None);
        };
        let masked_cols = caps.name("cols").map_or("", |m| m.as_str());
        if masked_cols.contains('*') {
            return Ok(None);
        }

        let table = group_named(&caps, body, "table").unwrap_or_default();
        let alias = group_named(&caps, body, "alias");
        if alias.is_some_and(|a| {
            ["WHERE", "JOIN", "ON", "GROUP", "ORDER", "LIMIT"]
                .iter()
                .any(|kw| a.eq_ignore_ascii_case(kw))
        }) {
            return Ok(None);
        }
        let outer = alias.unwrap_or(table);
        let col = group_named(&caps, body, "col").unwrap_or_default();
        let col = col.rsplit('.').next().unwrap_or(col);
        let inner_col = group_named(&caps, body, "inner_col").unwrap_or_default();
        let inner_table = group_named(&caps, body, "inner_table").unwrap_or_default();
        let inner_where = group_named(&caps, body, "inner_where").unwrap_or_default();

        // A correlated subquery cannot become a derived table.
        let masked_inner = caps.name("inner_where").map_or("", |m| m.as_str());
        if table.eq_ignore_ascii_case(inner_table)
            || !self.refs_stay_inside(masked_inner, inner_table)
        {
            return Ok(None);
        }

        Ok(Some(format!(
            "SELECT {cols} FROM {table}{alias} JOIN (SELECT DISTINCT {inner_col} AS sluice_semi_key FROM {inner_table}{inner_where}) sluice_semi ON {outer}.{col} = sluice_semi.sluice_semi_key",
            cols = cols,
            table = table,
            alias = alias.map(|a| format!(" {}", a)).unwrap_or_default(),
            inner_col = inner_col,
            inner_table = inner_table,
            inner_where = inner_where.trim_end(),
            outer = outer,
            col = col,
        )))
    }
}

pub struct AppendLimitRule {
    select: Regex,
}

impl AppendLimitRule {
    pub fn new() -> Result<Self, RuleError> {
        Ok(Self {
            select: Regex::new(r"(?is)^\s*(?:SELECT|WITH)\b")?,
        })
    }
}

impl RewriteRule for AppendLimitRule {
    fn name(&self) -> &str {
        "append_limit"
    }

    fn description(&self) -> &str {
        "Append a default LIMIT to large reads that have none"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn applies_to(&self, ctx: &RuleContext<'_>) -> bool {
        let m = ctx.metadata;
        !m.category.is_write() && !m.has_limit && m.estimated_rows > ctx.limit_row_threshold
    }

    fn rewrite(&self, sql: &SqlText, ctx: &RuleContext<'_>) -> Result<Option<String>, RuleError> {
        if !self.select.is_match(&sql.masked) {
            return Ok(None);
        }
        let body = trimmed_end(sql);
        if sql.masked[..body.len()].contains(';') {
            return Ok(None);
        }
        let limit = ctx.default_limit;
        tracing::debug!(target: "optimizer", limit, "Appending default LIMIT");
        Ok(Some(format!("{} LIMIT {}", body, limit)))
    }
}

/// Built-in rules, highest priority first.
pub fn builtin_rules() -> Result<Vec<Box<dyn RewriteRule>>, RuleError> {
    let mut rules: Vec<Box<dyn RewriteRule>> = vec![
        Box::new(StripTrailingSemicolonRule::new()?),
        Box::new(RemoveTautologyRule::new()?),
        Box::new(CountOneToCountStarRule::new()?),
        Box::new(OrChainToInRule::new()?),
        Box::new(InSubqueryToJoinRule::new()?),
        Box::new(AppendLimitRule::new()?),
    ];
    rules.sort_by(|a, b| b.priority().cmp(&a.priority()));
    Ok(rules)
}
