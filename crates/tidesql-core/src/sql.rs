//! Lightweight SQL scanning.
//!
//! This is not a parser. It splits statement text into lossless tokens and
//! recovers just enough structure for statement rewriting: the statement
//! kind, which tables are read or written (with their byte spans), the
//! conflict mode of inserts and the placement of the top-level `WHERE`.

use crate::identifiers::unquote_ident;
use std::borrow::Cow;
use std::collections::HashSet;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword
    Word,
    /// `"x"`, `` `x` `` or `[x]`
    QuotedIdent,
    /// `'text'`
    Literal,
    Number,
    /// `?`, `?3`, `:name`, `@name`, `$name`
    Parameter,
    Punct,
    Whitespace,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
}

impl Token<'_> {
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == 1 && self.text.starts_with(c)
    }

    fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    fn is_name(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut j = start + 1;
    while j < bytes.len() {
        if bytes[j] == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    bytes.len()
}

/// Split `sql` into tokens. Concatenating the token texts yields `sql`.
pub fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        let kind = match b {
            b if b.is_ascii_whitespace() => {
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                TokenKind::Whitespace
            }
            b'-' if next == Some(b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
                TokenKind::Comment
            }
            b'/' if next == Some(b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
                TokenKind::Comment
            }
            b'\'' => {
                i = scan_quoted(bytes, i, b'\'');
                TokenKind::Literal
            }
            b'"' | b'`' => {
                i = scan_quoted(bytes, i, b);
                TokenKind::QuotedIdent
            }
            b'[' => {
                i = bytes[i..]
                    .iter()
                    .position(|&c| c == b']')
                    .map_or(bytes.len(), |p| i + p + 1);
                TokenKind::QuotedIdent
            }
            b'?' => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                TokenKind::Parameter
            }
            b':' | b'@' | b'$' if next.is_some_and(is_ident_byte) => {
                i += 1;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                TokenKind::Parameter
            }
            b'0'..=b'9' => {
                i = scan_number(bytes, i);
                TokenKind::Number
            }
            b'.' if next.is_some_and(|c| c.is_ascii_digit()) => {
                i = scan_number(bytes, i);
                TokenKind::Number
            }
            b if is_ident_byte(b) => {
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            _ => {
                i += 1;
                TokenKind::Punct
            }
        };
        tokens.push(Token {
            kind,
            text: &sql[start..i],
            start,
        });
    }
    tokens
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut j = start;
    while j < bytes.len() {
        let c = bytes[j];
        let exponent_sign = (c == b'+' || c == b'-')
            && j > start
            && matches!(bytes[j - 1], b'e' | b'E')
            && !bytes[start..j].starts_with(b"0x");
        if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' || exponent_sign {
            j += 1;
        } else {
            break;
        }
    }
    j
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    /// CREATE / DROP / ALTER
    Schema,
    Pragma,
    /// BEGIN / COMMIT / END / ROLLBACK / SAVEPOINT / RELEASE
    Transaction,
    Other,
}

impl StatementKind {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

/// `OR <mode>` conflict resolution of an INSERT or UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictMode {
    #[default]
    Abort,
    Rollback,
    Fail,
    Ignore,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRole {
    Read,
    Write,
}

/// A table name occurrence in a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub role: TableRole,
    /// Byte range of the possibly schema-qualified name.
    pub span: Range<usize>,
    /// An alias follows the name.
    pub aliased: bool,
}

impl TableRef {
    /// Unqualified or `main.`-qualified.
    pub fn is_main(&self) -> bool {
        self.schema
            .as_deref()
            .is_none_or(|s| s.eq_ignore_ascii_case("main"))
    }
}

/// Structural summary of the first statement in a SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub kind: StatementKind,
    pub conflict: ConflictMode,
    pub tables: Vec<TableRef>,
    pub returning: bool,
    pub upsert: bool,
    /// Top-level `WHERE` of an UPDATE/DELETE: keyword range and expression end.
    pub where_clause: Option<(Range<usize>, usize)>,
    /// Where a `WHERE` clause can be inserted when there is none.
    pub where_insert_at: usize,
    /// Byte offset just past the last token of the first statement.
    pub end: usize,
}

impl StatementInfo {
    pub fn write_target(&self) -> Option<&TableRef> {
        self.tables.iter().find(|t| t.role == TableRole::Write)
    }
}

const ALIAS_STOP_WORDS: &[&str] = &[
    "WHERE",
    "JOIN",
    "INNER",
    "LEFT",
    "RIGHT",
    "FULL",
    "OUTER",
    "CROSS",
    "NATURAL",
    "ON",
    "USING",
    "GROUP",
    "ORDER",
    "LIMIT",
    "OFFSET",
    "HAVING",
    "WINDOW",
    "UNION",
    "INTERSECT",
    "EXCEPT",
    "SET",
    "VALUES",
    "DEFAULT",
    "SELECT",
    "RETURNING",
    "INDEXED",
    "NOT",
    "FROM",
    "DO",
];

const FROM_LIST_ENDS: &[&str] = &[
    "WHERE",
    "GROUP",
    "HAVING",
    "ORDER",
    "LIMIT",
    "WINDOW",
    "UNION",
    "INTERSECT",
    "EXCEPT",
    "RETURNING",
    "SET",
    "VALUES",
];

fn is_any_keyword(token: &Token<'_>, words: &[&str]) -> bool {
    token.kind == TokenKind::Word && words.iter().any(|w| token.text.eq_ignore_ascii_case(w))
}

struct Scan<'a> {
    sig: Vec<Token<'a>>,
}

impl<'a> Scan<'a> {
    fn at(&self, i: usize) -> Option<&Token<'a>> {
        self.sig.get(i)
    }

    fn keyword_at(&self, i: usize, keyword: &str) -> bool {
        self.at(i).is_some_and(|t| t.is_keyword(keyword))
    }

    fn punct_at(&self, i: usize, c: char) -> bool {
        self.at(i).is_some_and(|t| t.is_punct(c))
    }

    /// Parse `[schema.]name [[AS] alias]` at `i`.
    fn table_ref(&self, i: usize, role: TableRole, allow_call: bool) -> Option<TableRef> {
        let first = self.at(i)?;
        if !first.is_name() || is_any_keyword(first, &["SELECT", "VALUES", "WITH"]) {
            return None;
        }
        let (schema, name_idx) = if self.punct_at(i + 1, '.') && self.at(i + 2)?.is_name() {
            (Some(unquote_ident(first.text)), i + 2)
        } else {
            (None, i)
        };
        let name_tok = self.at(name_idx)?;
        if !allow_call && self.punct_at(name_idx + 1, '(') {
            return None;
        }
        let aliased = match self.at(name_idx + 1) {
            Some(t) if t.is_keyword("AS") => true,
            Some(t) if t.kind == TokenKind::QuotedIdent => true,
            Some(t) if t.kind == TokenKind::Word => !is_any_keyword(t, ALIAS_STOP_WORDS),
            _ => false,
        };
        Some(TableRef {
            schema,
            name: unquote_ident(name_tok.text),
            role,
            span: first.start..name_tok.end(),
            aliased,
        })
    }

    /// Names introduced by `name [(cols)] AS [NOT] [MATERIALIZED] (`.
    fn cte_names(&self, n: usize) -> HashSet<String> {
        let mut names = HashSet::new();
        for i in 0..n {
            let tok = &self.sig[i];
            if !tok.is_name() {
                continue;
            }
            let mut j = i + 1;
            if self.punct_at(j, '(') {
                let mut depth = 0usize;
                while j < n {
                    if self.sig[j].is_punct('(') {
                        depth += 1;
                    } else if self.sig[j].is_punct(')') {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    j += 1;
                }
                j += 1;
            }
            if !self.keyword_at(j, "AS") {
                continue;
            }
            j += 1;
            if self.keyword_at(j, "NOT") {
                j += 1;
            }
            if self.keyword_at(j, "MATERIALIZED") {
                j += 1;
            }
            if self.punct_at(j, '(') {
                names.insert(unquote_ident(tok.text).to_ascii_lowercase());
            }
        }
        names
    }
}

/// Scan the first statement of `sql`.
pub fn analyze(sql: &str) -> StatementInfo {
    let scan = Scan {
        sig: tokenize(sql).into_iter().filter(|t| !t.is_trivia()).collect(),
    };

    let mut depth = 0usize;
    let mut n = scan.sig.len();
    for (i, t) in scan.sig.iter().enumerate() {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth = depth.saturating_sub(1);
        } else if t.is_punct(';') && depth == 0 {
            n = i;
            break;
        }
    }
    let end = if n == 0 { 0 } else { scan.sig[n - 1].end() };

    let mut info = StatementInfo {
        kind: StatementKind::Other,
        conflict: ConflictMode::Abort,
        tables: Vec::new(),
        returning: false,
        upsert: false,
        where_clause: None,
        where_insert_at: end,
        end,
    };
    if n == 0 {
        return info;
    }

    let verb_idx = if scan.sig[0].is_keyword("WITH") {
        let mut depth = 0usize;
        let mut found = None;
        for (i, t) in scan.sig[..n].iter().enumerate().skip(1) {
            if t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(')') {
                depth = depth.saturating_sub(1);
            } else if depth == 0
                && is_any_keyword(t, &["SELECT", "VALUES", "INSERT", "REPLACE", "UPDATE", "DELETE"])
            {
                found = Some(i);
                break;
            }
        }
        match found {
            Some(i) => i,
            None => return info,
        }
    } else {
        0
    };

    let verb = scan.sig[verb_idx];
    info.kind = match verb.text.to_ascii_uppercase().as_str() {
        "SELECT" | "VALUES" => StatementKind::Select,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" | "DROP" | "ALTER" => StatementKind::Schema,
        "PRAGMA" => StatementKind::Pragma,
        "BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
            StatementKind::Transaction
        }
        _ => StatementKind::Other,
    };
    if !matches!(
        info.kind,
        StatementKind::Select | StatementKind::Insert | StatementKind::Update | StatementKind::Delete
    ) {
        return info;
    }

    let ctes = scan.cte_names(n);
    let keep = |r: &TableRef| r.schema.is_some() || !ctes.contains(&r.name.to_ascii_lowercase());

    // Write target.
    let mut consumed_from = None;
    let mut target_idx = None;
    match info.kind {
        StatementKind::Insert => {
            if verb.is_keyword("REPLACE") {
                info.conflict = ConflictMode::Replace;
            } else if scan.keyword_at(verb_idx + 1, "OR") {
                info.conflict = conflict_mode(scan.at(verb_idx + 2));
            }
            let mut depth = 0usize;
            for i in verb_idx + 1..n {
                let t = &scan.sig[i];
                if t.is_punct('(') {
                    depth += 1;
                } else if t.is_punct(')') {
                    depth = depth.saturating_sub(1);
                } else if depth == 0 && t.is_keyword("INTO") {
                    target_idx = Some(i + 1);
                    break;
                }
            }
        }
        StatementKind::Update => {
            let mut i = verb_idx + 1;
            if scan.keyword_at(i, "OR") {
                info.conflict = conflict_mode(scan.at(i + 1));
                i += 2;
            }
            target_idx = Some(i);
        }
        StatementKind::Delete => {
            if scan.keyword_at(verb_idx + 1, "FROM") {
                consumed_from = Some(verb_idx + 1);
                target_idx = Some(verb_idx + 2);
            }
        }
        _ => {}
    }
    if let Some(t) = target_idx.and_then(|i| scan.table_ref(i, TableRole::Write, true)) {
        info.tables.push(t);
    }

    // Reads.
    let mut from_lists: Vec<bool> = vec![false];
    for i in 0..n {
        let t = &scan.sig[i];
        if t.is_punct('(') {
            from_lists.push(false);
            continue;
        }
        if t.is_punct(')') {
            if from_lists.len() > 1 {
                from_lists.pop();
            }
            continue;
        }
        let top = from_lists.len() - 1;
        let in_from = &mut from_lists[top];
        let starts_ref = if t.is_keyword("FROM") {
            let distinct = i > 0 && scan.sig[i - 1].is_keyword("DISTINCT");
            if Some(i) == consumed_from || distinct {
                false
            } else {
                *in_from = true;
                true
            }
        } else if t.is_keyword("JOIN") {
            true
        } else if t.is_punct(',') {
            *in_from
        } else {
            if is_any_keyword(t, FROM_LIST_ENDS) {
                *in_from = false;
            }
            false
        };
        if starts_ref {
            if let Some(r) = scan.table_ref(i + 1, TableRole::Read, false) {
                if keep(&r) {
                    info.tables.push(r);
                }
            }
        }
    }
    info.tables.sort_by_key(|t| t.span.start);

    // Top-level clauses after the verb.
    let mut depth = 0usize;
    let mut tail_start = None;
    let mut where_kw: Option<Range<usize>> = None;
    let after_target = target_idx.unwrap_or(verb_idx);
    for i in verb_idx + 1..n {
        let t = &scan.sig[i];
        if t.is_punct('(') {
            depth += 1;
            continue;
        }
        if t.is_punct(')') {
            depth = depth.saturating_sub(1);
            continue;
        }
        if depth != 0 {
            continue;
        }
        if t.is_keyword("RETURNING") {
            info.returning = true;
        }
        if info.kind == StatementKind::Insert
            && t.is_keyword("ON")
            && scan.keyword_at(i + 1, "CONFLICT")
        {
            info.upsert = true;
        }
        if i > after_target && matches!(info.kind, StatementKind::Update | StatementKind::Delete) {
            if t.is_keyword("WHERE") && where_kw.is_none() {
                where_kw = Some(t.start..t.end());
            } else if tail_start.is_none() && is_any_keyword(t, &["RETURNING", "ORDER", "LIMIT"]) {
                tail_start = Some(t.start);
            }
        }
    }
    if matches!(info.kind, StatementKind::Update | StatementKind::Delete) {
        let clause_end = tail_start.unwrap_or(end);
        info.where_insert_at = clause_end;
        info.where_clause = where_kw.map(|kw| (kw, clause_end));
    }
    info
}

fn conflict_mode(token: Option<&Token<'_>>) -> ConflictMode {
    match token.map(|t| t.text.to_ascii_uppercase()).as_deref() {
        Some("REPLACE") => ConflictMode::Replace,
        Some("IGNORE") => ConflictMode::Ignore,
        Some("ROLLBACK") => ConflictMode::Rollback,
        Some("FAIL") => ConflictMode::Fail,
        _ => ConflictMode::Abort,
    }
}

/// Apply non-overlapping byte-range replacements to `sql`.
pub fn splice(sql: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(range, _)| range.start);
    let mut out = String::with_capacity(sql.len() + 64);
    let mut cursor = 0;
    for (range, replacement) in edits {
        if range.start < cursor {
            continue;
        }
        out.push_str(&sql[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Anything that can be prepared on a handle.
///
/// Query builders implement this to hand their rendered text (and, when they
/// know it, their table list) to the engine.
pub trait Statement {
    fn sql(&self) -> Cow<'_, str>;

    fn info(&self) -> StatementInfo {
        analyze(&self.sql())
    }

    fn referenced_tables(&self) -> Vec<TableRef> {
        self.info().tables
    }
}

impl Statement for str {
    fn sql(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl Statement for String {
    fn sql(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl<T: Statement + ?Sized> Statement for &T {
    fn sql(&self) -> Cow<'_, str> {
        (**self).sql()
    }

    fn info(&self) -> StatementInfo {
        (**self).info()
    }
}
