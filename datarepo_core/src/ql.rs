//! A small object query language over entity attributes.
//!
//! ```text
//! select m from Member m where m.username = :username and m.age = :age
//! select m.username from Member m
//! select new MemberDto(m.id, m.username, t.name) from Member m join m.team t
//! select count(m) from Member m where m.age > ?1
//! update Member m set m.age = m.age + 1 where m.age >= :age
//! delete from Member m where m.username in :names
//! ```
//!
//! Statements are parsed and checked against entity metadata once; each call binds
//! named (`:name`) or positional (`?1`) parameters.

use std::iter::Peekable;
use std::str::CharIndices;

use crate::paging::{Direction, Order, Sort};
use crate::query::{
    Affix, Assignment, BulkDelete, BulkUpdate, CompareOp, CountQuery, Join, JoinKind, Operand,
    Params, Path, Predicate, SelectQuery, SetExpr,
};
use crate::{ColumnKind, EntityMeta, Fetchable, Identifiable, ParamValue, QueryError};

/// What a select statement returns per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// `select m`: whole entities.
    Entity,
    /// `select m.a, t.b`: the listed values in order.
    Columns(Vec<Path>),
    /// `select new Dto(...)`: the listed values in constructor argument order.
    Constructor { name: String, columns: Vec<Path> },
    /// `select count(m)`.
    Count,
    Update,
    Delete,
}

/// Result shape a repository method declares for its query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Entities,
    /// A single selected value per row.
    Scalar,
    /// A column list or constructor expression.
    Row,
    Count,
    /// `update` or `delete`.
    Modifying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    Named(String),
    Positional(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Select(SelectQuery),
    Update(BulkUpdate),
    Delete(BulkDelete),
}

/// A parsed and validated query text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextQuery {
    text: String,
    shape: Shape,
    statement: Statement,
    parameters: Vec<Parameter>,
}

impl TextQuery {
    pub fn parse<T: Fetchable + Identifiable>(text: &str) -> Result<Self, QueryError> {
        Self::parse_with(EntityMeta::of::<T>(), text)
    }

    pub fn parse_with(entity: EntityMeta, text: &str) -> Result<Self, QueryError> {
        let tokens = tokenize(text)?;
        Parser {
            text,
            tokens,
            pos: 0,
            entity,
            root_alias: None,
            joins: Vec::new(),
            parameters: Vec::new(),
        }
        .statement()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn is_modifying(&self) -> bool {
        matches!(self.shape, Shape::Update | Shape::Delete)
    }

    /// Fail unless the statement produces what the caller declared.
    pub fn expect(&self, expect: Expect) -> Result<(), QueryError> {
        let ok = match (&self.shape, expect) {
            (Shape::Entity, Expect::Entities) => true,
            (Shape::Columns(cols), Expect::Scalar) => cols.len() == 1,
            (Shape::Columns(_) | Shape::Constructor { .. }, Expect::Row) => true,
            (Shape::Count, Expect::Count) => true,
            (Shape::Update | Shape::Delete, Expect::Modifying) => true,
            _ => false,
        };
        if ok {
            return Ok(());
        }
        let describe = |e: Expect| match e {
            Expect::Entities => "entities",
            Expect::Scalar => "a single value per row",
            Expect::Row => "a row of values",
            Expect::Count => "a count",
            Expect::Modifying => "an update or delete",
        };
        let found = match &self.shape {
            Shape::Entity => "entities".to_string(),
            Shape::Columns(cols) => format!("{} value(s) per row", cols.len()),
            Shape::Constructor { name, .. } => format!("`{name}` rows"),
            Shape::Count => "a count".to_string(),
            Shape::Update => "an update".to_string(),
            Shape::Delete => "a delete".to_string(),
        };
        Err(QueryError::ResultShape {
            query: self.text.clone(),
            expected: describe(expect).to_string(),
            found,
        })
    }

    /// Every parameter must be satisfiable from method arguments named `names`.
    pub fn check_arguments(&self, names: &[&str]) -> Result<(), QueryError> {
        for p in &self.parameters {
            match p {
                Parameter::Named(n) if !names.contains(&n.as_str()) => {
                    return Err(QueryError::MissingParameter(n.clone()));
                }
                Parameter::Positional(i) if *i > names.len() => {
                    return Err(QueryError::Arity {
                        expected: *i,
                        actual: names.len(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn shape_error(&self, expected: &str) -> QueryError {
        QueryError::ResultShape {
            query: self.text.clone(),
            expected: expected.to_string(),
            found: format!("{:?}", self.shape).to_lowercase(),
        }
    }

    /// The select for entity, column, constructor or count statements.
    pub fn bind_select(&self, params: &Params) -> Result<SelectQuery, QueryError> {
        match &self.statement {
            Statement::Select(q) => q.bind(params),
            _ => Err(self.shape_error("a select")),
        }
    }

    pub fn bind_count(&self, params: &Params) -> Result<CountQuery, QueryError> {
        Ok(self.bind_select(params)?.to_count())
    }

    pub fn bind_update(&self, params: &Params) -> Result<BulkUpdate, QueryError> {
        match &self.statement {
            Statement::Update(u) => u.bind(params),
            _ => Err(self.shape_error("an update")),
        }
    }

    pub fn bind_delete(&self, params: &Params) -> Result<BulkDelete, QueryError> {
        match &self.statement {
            Statement::Delete(d) => d.bind(params),
            _ => Err(self.shape_error("a delete")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Named(String),
    Positional(usize),
    Str(String),
    Int(i64),
    Float(f64),
    Sym(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn syntax(text: &str, offset: usize, message: impl Into<String>) -> QueryError {
    QueryError::Syntax {
        query: text.to_string(),
        offset,
        message: message.into(),
    }
}

fn take_while(chars: &mut Peekable<CharIndices<'_>>, mut f: impl FnMut(char) -> bool) -> String {
    let mut out = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if !f(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}

fn tokenize(text: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        let tok = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                Tok::Ident(take_while(&mut chars, |c| c.is_alphanumeric() || c == '_'))
            }
            c if c.is_ascii_digit() => {
                let digits = take_while(&mut chars, |c| c.is_ascii_digit() || c == '.');
                if digits.contains('.') {
                    Tok::Float(
                        digits
                            .parse()
                            .map_err(|_| syntax(text, offset, format!("bad number `{digits}`")))?,
                    )
                } else {
                    Tok::Int(
                        digits
                            .parse()
                            .map_err(|_| syntax(text, offset, format!("bad number `{digits}`")))?,
                    )
                }
            }
            ':' => {
                chars.next();
                let name = take_while(&mut chars, |c| c.is_alphanumeric() || c == '_');
                if name.is_empty() {
                    return Err(syntax(text, offset, "expected a parameter name after `:`"));
                }
                Tok::Named(name)
            }
            '?' => {
                chars.next();
                let digits = take_while(&mut chars, |c| c.is_ascii_digit());
                match digits.parse::<usize>() {
                    Ok(i) if i >= 1 => Tok::Positional(i),
                    _ => {
                        return Err(syntax(
                            text,
                            offset,
                            "positional parameters are written ?1, ?2, ...",
                        ))
                    }
                }
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\'')) => {
                            if matches!(chars.peek(), Some((_, '\''))) {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some((_, c)) => s.push(c),
                        None => return Err(syntax(text, offset, "unterminated string literal")),
                    }
                }
                Tok::Str(s)
            }
            _ => {
                chars.next();
                let next = chars.peek().map(|&(_, c)| c);
                let sym = match (c, next) {
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', Some('>')) => "<>",
                    ('!', Some('=')) => "<>",
                    ('.', _) => ".",
                    (',', _) => ",",
                    ('(', _) => "(",
                    (')', _) => ")",
                    ('=', _) => "=",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    ('+', _) => "+",
                    ('-', _) => "-",
                    ('*', _) => "*",
                    _ => return Err(syntax(text, offset, format!("unexpected character `{c}`"))),
                };
                if sym.len() == 2 {
                    chars.next();
                }
                Tok::Sym(sym)
            }
        };
        tokens.push(Token { tok, offset });
    }
    Ok(tokens)
}

const KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "join", "left", "inner", "outer", "fetch",
    "order", "by", "asc", "desc", "in", "is", "null", "like", "between", "new", "count",
    "distinct", "update", "set", "delete", "true", "false", "as",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn incompatible(path: &Path, operator: &str, kind: ColumnKind) -> QueryError {
    QueryError::IncompatibleOperator {
        property: path.to_string(),
        operator: operator.to_string(),
        kind: kind.to_string(),
    }
}

/// A dotted identifier chain before alias resolution.
#[derive(Debug, Clone)]
struct RawPath {
    parts: Vec<String>,
    offset: usize,
}

enum Resolved {
    RootAlias,
    Path(Path),
}

enum SelectItem {
    Path(RawPath),
    Count,
    Constructor { name: String, args: Vec<RawPath> },
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    entity: EntityMeta,
    root_alias: Option<String>,
    /// (alias, relation) pairs from `join` clauses.
    joins: Vec<(Option<String>, Join)>,
    parameters: Vec<Parameter>,
}

impl Parser<'_> {
    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or(self.text.len())
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        syntax(self.text, self.offset(), message)
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + n).map(|t| &t.tok)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn peek_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), QueryError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{kw}`")))
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), QueryError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{sym}`")))
        }
    }

    fn ident(&mut self) -> Result<String, QueryError> {
        match self.peek() {
            Some(Tok::Ident(w)) if !is_keyword(w) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.error("expected an identifier")),
        }
    }

    /// An optional alias after an entity or join path.
    fn alias(&mut self) -> Result<Option<String>, QueryError> {
        if self.eat_kw("as") {
            return self.ident().map(Some);
        }
        match self.peek() {
            Some(Tok::Ident(w)) if !is_keyword(w) => self.ident().map(Some),
            _ => Ok(None),
        }
    }

    fn raw_path(&mut self) -> Result<RawPath, QueryError> {
        let offset = self.offset();
        let mut parts = vec![self.ident()?];
        while self.eat_sym(".") {
            parts.push(self.ident()?);
        }
        Ok(RawPath { parts, offset })
    }

    fn entity_name(&mut self) -> Result<(), QueryError> {
        let name = self.ident()?;
        if name != self.entity.name {
            return Err(QueryError::EntityMismatch {
                expected: self.entity.name.to_string(),
                found: name,
            });
        }
        Ok(())
    }

    fn statement(mut self) -> Result<TextQuery, QueryError> {
        let (shape, statement) = if self.eat_kw("select") {
            self.select()?
        } else if self.eat_kw("update") {
            (Shape::Update, Statement::Update(self.update()?))
        } else if self.eat_kw("delete") {
            (Shape::Delete, Statement::Delete(self.delete()?))
        } else {
            return Err(self.error("expected `select`, `update` or `delete`"));
        };
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(TextQuery {
            text: self.text.to_string(),
            shape,
            statement,
            parameters: self.parameters,
        })
    }

    fn select(&mut self) -> Result<(Shape, Statement), QueryError> {
        let distinct = self.eat_kw("distinct");
        let mut items = vec![self.select_item()?];
        while self.eat_sym(",") {
            items.push(self.select_item()?);
        }

        self.expect_kw("from")?;
        self.entity_name()?;
        self.root_alias = self.alias()?;
        self.join_clauses()?;

        let mut query = SelectQuery::new(self.entity);
        if distinct {
            query = query.distinct();
        }
        if self.eat_kw("where") {
            query = query.filter(self.or_expr()?);
        }
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            query = query.sorted(self.order_list()?);
        }
        for (_, join) in &self.joins {
            query.joins.push(join.clone());
        }

        let selects_root = match items.as_slice() {
            [SelectItem::Path(p)] => matches!(self.resolve(p)?, Resolved::RootAlias),
            _ => false,
        };
        let shape = match items.as_slice() {
            [SelectItem::Count] => Shape::Count,
            [SelectItem::Constructor { name, args }] => {
                let columns = args
                    .iter()
                    .map(|a| self.column_path(a))
                    .collect::<Result<Vec<_>, _>>()?;
                Shape::Constructor {
                    name: name.clone(),
                    columns,
                }
            }
            _ if selects_root => Shape::Entity,
            _ => {
                let mut columns = Vec::new();
                for item in &items {
                    match item {
                        SelectItem::Path(p) => columns.push(self.column_path(p)?),
                        _ => {
                            return Err(QueryError::Unsupported(
                                "count or constructor mixed with other select items".into(),
                            ))
                        }
                    }
                }
                Shape::Columns(columns)
            }
        };
        match &shape {
            Shape::Columns(cols) | Shape::Constructor { columns: cols, .. } => {
                query = query.columns(cols.clone());
            }
            _ => {}
        }
        query.validate()?;
        Ok((shape, Statement::Select(query)))
    }

    fn select_item(&mut self) -> Result<SelectItem, QueryError> {
        if self.peek_kw("count") && matches!(self.peek_at(1), Some(Tok::Sym("("))) {
            self.pos += 2;
            self.eat_kw("distinct");
            if !self.eat_sym("*") {
                self.raw_path()?;
            }
            self.expect_sym(")")?;
            return Ok(SelectItem::Count);
        }
        if self.eat_kw("new") {
            let mut name = self.ident()?;
            while self.eat_sym(".") {
                name = self.ident()?;
            }
            self.expect_sym("(")?;
            let mut args = vec![self.raw_path()?];
            while self.eat_sym(",") {
                args.push(self.raw_path()?);
            }
            self.expect_sym(")")?;
            return Ok(SelectItem::Constructor { name, args });
        }
        Ok(SelectItem::Path(self.raw_path()?))
    }

    fn join_clauses(&mut self) -> Result<(), QueryError> {
        loop {
            let kind = if self.eat_kw("left") {
                self.eat_kw("outer");
                self.expect_kw("join")?;
                JoinKind::Left
            } else if self.eat_kw("inner") {
                self.expect_kw("join")?;
                JoinKind::Inner
            } else if self.eat_kw("join") {
                JoinKind::Inner
            } else {
                return Ok(());
            };
            let fetch = self.eat_kw("fetch");
            let raw = self.raw_path()?;
            let relation = match (self.root_alias.as_deref(), raw.parts.as_slice()) {
                (Some(root), [alias, rel]) if alias == root => rel.clone(),
                (None, [rel]) => rel.clone(),
                _ => {
                    return Err(syntax(
                        self.text,
                        raw.offset,
                        "expected `alias.relation` after `join`",
                    ))
                }
            };
            if self.entity.relation(&relation).is_none() {
                return Err(QueryError::UnknownRelation {
                    entity: self.entity.name.to_string(),
                    relation,
                });
            }
            let alias = self.alias()?;
            self.joins.push((
                alias,
                Join {
                    relation,
                    kind,
                    fetch,
                },
            ));
        }
    }

    /// Resolve a raw path against the root alias and join aliases.
    fn resolve(&self, raw: &RawPath) -> Result<Resolved, QueryError> {
        let parts: Vec<&str> = raw.parts.iter().map(String::as_str).collect();
        let rest: &[&str] = match (&self.root_alias, parts.as_slice()) {
            (Some(root), [first, rest @ ..]) if *first == root.as_str() => rest,
            (Some(_), [first, rest @ ..]) => {
                let join = self
                    .joins
                    .iter()
                    .find(|(alias, _)| alias.as_deref() == Some(*first));
                return match (join, rest) {
                    (Some((_, join)), [column]) => {
                        Ok(Resolved::Path(Path::joined(join.relation.clone(), *column)))
                    }
                    (Some(_), _) => Err(QueryError::Unsupported(format!(
                        "path `{}`",
                        raw.parts.join(".")
                    ))),
                    (None, _) => Err(QueryError::UnknownAlias(first.to_string())),
                };
            }
            (None, all) => all,
            (_, []) => return Err(syntax(self.text, raw.offset, "empty path")),
        };
        match rest {
            [] => Ok(Resolved::RootAlias),
            [column] => Ok(Resolved::Path(match self.entity.relation(column) {
                Some(rel) => Path::column(rel.column),
                None => Path::column(*column),
            })),
            [relation, column] => Ok(Resolved::Path(Path::joined(*relation, *column))),
            _ => Err(QueryError::Unsupported(format!(
                "path `{}`",
                raw.parts.join(".")
            ))),
        }
    }

    fn column_path(&self, raw: &RawPath) -> Result<Path, QueryError> {
        match self.resolve(raw)? {
            Resolved::Path(p) => {
                self.entity.resolve(&p)?;
                Ok(p)
            }
            Resolved::RootAlias => Err(syntax(
                self.text,
                raw.offset,
                "an entity alias cannot be combined with other select items",
            )),
        }
    }

    fn typed_path(&mut self) -> Result<(Path, ColumnKind), QueryError> {
        let raw = self.raw_path()?;
        let path = self.column_path(&raw)?;
        let kind = self.entity.resolve(&path)?;
        Ok((path, kind))
    }

    fn or_expr(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.and_expr()?;
        while self.eat_kw("or") {
            left = left.or(self.and_expr()?);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.unary()?;
        while self.eat_kw("and") {
            left = left.and(self.unary()?);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Predicate, QueryError> {
        if self.eat_kw("not") {
            return Ok(self.unary()?.not());
        }
        if self.eat_sym("(") {
            let inner = self.or_expr()?;
            self.expect_sym(")")?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Predicate, QueryError> {
        let (path, kind) = self.typed_path()?;

        if self.eat_kw("is") {
            let negated = self.eat_kw("not");
            self.expect_kw("null")?;
            return Ok(Predicate::Null { path, negated });
        }
        let negated = self.eat_kw("not");
        if self.eat_kw("between") {
            if !kind.is_orderable() {
                return Err(incompatible(&path, "between", kind));
            }
            let low = self.operand()?;
            self.expect_kw("and")?;
            let high = self.operand()?;
            let p = Predicate::Between { path, low, high };
            return Ok(if negated { p.not() } else { p });
        }
        if self.eat_kw("in") {
            let values = if self.eat_sym("(") {
                let mut list = Vec::new();
                loop {
                    match self.operand()? {
                        Operand::Value(v) => list.push(v),
                        _ => {
                            return Err(QueryError::Unsupported(
                                "parameters inside an `in (...)` list; bind a list parameter instead"
                                    .into(),
                            ))
                        }
                    }
                    if !self.eat_sym(",") {
                        break;
                    }
                }
                self.expect_sym(")")?;
                Operand::Value(ParamValue::List(list))
            } else {
                self.operand()?
            };
            return Ok(Predicate::In {
                path,
                values,
                negated,
            });
        }
        if self.eat_kw("like") {
            if !matches!(kind, ColumnKind::Text | ColumnKind::Other) {
                return Err(incompatible(&path, "like", kind));
            }
            let pattern = self.operand()?;
            return Ok(Predicate::Like {
                path,
                pattern,
                affix: Affix::Exact,
                negated,
            });
        }
        if negated {
            return Err(self.error("expected `between`, `in` or `like` after `not`"));
        }
        let op = match self.peek() {
            Some(Tok::Sym("=")) => CompareOp::Eq,
            Some(Tok::Sym("<>")) => CompareOp::Ne,
            Some(Tok::Sym(">")) => CompareOp::Gt,
            Some(Tok::Sym(">=")) => CompareOp::Ge,
            Some(Tok::Sym("<")) => CompareOp::Lt,
            Some(Tok::Sym("<=")) => CompareOp::Le,
            _ => return Err(self.error("expected a comparison operator")),
        };
        self.pos += 1;
        if !matches!(op, CompareOp::Eq | CompareOp::Ne) && !kind.is_orderable() {
            return Err(incompatible(&path, op.as_sql(), kind));
        }
        let value = self.operand()?;
        Ok(Predicate::Compare { path, op, value })
    }

    fn operand(&mut self) -> Result<Operand, QueryError> {
        let offset = self.offset();
        let operand = match self.bump() {
            Some(Tok::Named(n)) => {
                let p = Parameter::Named(n.clone());
                if !self.parameters.contains(&p) {
                    self.parameters.push(p);
                }
                Operand::Named(n)
            }
            Some(Tok::Positional(i)) => {
                let p = Parameter::Positional(i);
                if !self.parameters.contains(&p) {
                    self.parameters.push(p);
                }
                Operand::Positional(i)
            }
            Some(Tok::Str(s)) => Operand::Value(ParamValue::String(s)),
            Some(Tok::Int(v)) => Operand::Value(ParamValue::I64(v)),
            Some(Tok::Float(v)) => Operand::Value(ParamValue::F64(v)),
            Some(Tok::Sym("-")) => match self.bump() {
                Some(Tok::Int(v)) => Operand::Value(ParamValue::I64(-v)),
                Some(Tok::Float(v)) => Operand::Value(ParamValue::F64(-v)),
                _ => return Err(syntax(self.text, offset, "expected a number after `-`")),
            },
            Some(Tok::Ident(w)) if w.eq_ignore_ascii_case("true") => Operand::Value(true.into()),
            Some(Tok::Ident(w)) if w.eq_ignore_ascii_case("false") => Operand::Value(false.into()),
            Some(Tok::Ident(w)) if w.eq_ignore_ascii_case("null") => {
                return Err(syntax(self.text, offset, "compare with `is null` instead"))
            }
            Some(Tok::Ident(_)) => {
                return Err(QueryError::Unsupported(
                    "comparing two attributes".into(),
                ))
            }
            _ => return Err(syntax(self.text, offset, "expected a value or parameter")),
        };
        Ok(operand)
    }

    fn order_list(&mut self) -> Result<Sort, QueryError> {
        let mut orders = Vec::new();
        loop {
            let (path, _) = self.typed_path()?;
            let direction = if self.eat_kw("desc") {
                Direction::Desc
            } else {
                self.eat_kw("asc");
                Direction::Asc
            };
            orders.push(Order { path, direction });
            if !self.eat_sym(",") {
                break;
            }
        }
        Ok(Sort::from_orders(orders))
    }

    fn root_column(&mut self) -> Result<(String, ColumnKind), QueryError> {
        let offset = self.offset();
        let (path, kind) = self.typed_path()?;
        if path.is_joined() {
            return Err(syntax(
                self.text,
                offset,
                "bulk statements can only reference columns of the target entity",
            ));
        }
        Ok((path.column, kind))
    }

    fn update(&mut self) -> Result<BulkUpdate, QueryError> {
        self.entity_name()?;
        self.root_alias = self.alias()?;
        self.expect_kw("set")?;
        let mut assignments = Vec::new();
        loop {
            let (column, _) = self.root_column()?;
            self.expect_sym("=")?;
            let value = match self.peek() {
                Some(Tok::Ident(w)) if !is_keyword(w) => {
                    let (source, kind) = self.root_column()?;
                    if !matches!(kind, ColumnKind::Integer | ColumnKind::Float | ColumnKind::Other)
                    {
                        return Err(QueryError::IncompatibleOperator {
                            property: source,
                            operator: "+/-".into(),
                            kind: kind.to_string(),
                        });
                    }
                    if self.eat_sym("+") {
                        SetExpr::Add(source, self.operand()?)
                    } else if self.eat_sym("-") {
                        SetExpr::Sub(source, self.operand()?)
                    } else {
                        return Err(QueryError::Unsupported(
                            "assigning one attribute to another".into(),
                        ));
                    }
                }
                _ => SetExpr::Value(self.operand()?),
            };
            assignments.push(Assignment { column, value });
            if !self.eat_sym(",") {
                break;
            }
        }
        let filter = self.bulk_filter()?;
        Ok(BulkUpdate {
            entity: self.entity,
            assignments,
            filter,
        })
    }

    fn delete(&mut self) -> Result<BulkDelete, QueryError> {
        self.eat_kw("from");
        self.entity_name()?;
        self.root_alias = self.alias()?;
        let filter = self.bulk_filter()?;
        Ok(BulkDelete {
            entity: self.entity,
            filter,
        })
    }

    fn bulk_filter(&mut self) -> Result<Option<Predicate>, QueryError> {
        if !self.eat_kw("where") {
            return Ok(None);
        }
        let offset = self.offset();
        let filter = self.or_expr()?;
        if filter.paths().iter().any(|p| p.is_joined()) {
            return Err(syntax(
                self.text,
                offset,
                "bulk statements can only reference columns of the target entity",
            ));
        }
        Ok(Some(filter))
    }
}
