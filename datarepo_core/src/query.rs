//! Engine-neutral query model.
//!
//! Derived queries, query text, specifications and hand-written custom queries all
//! lower into these values; engines only ever see `SelectQuery`, `CountQuery`,
//! `BulkUpdate` and `BulkDelete`.

use std::fmt;

use crate::paging::Sort;
use crate::{EntityMeta, ParamValue, QueryError};

/// An attribute path rooted at the queried entity: `username` or `team.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub relation: Option<String>,
    pub column: String,
}

impl Path {
    pub fn column(column: impl Into<String>) -> Self {
        Self {
            relation: None,
            column: column.into(),
        }
    }

    pub fn joined(relation: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            relation: Some(relation.into()),
            column: column.into(),
        }
    }

    /// Parse `column` or `relation.column`. Deeper paths are not supported.
    pub fn parse(s: &str) -> Result<Self, QueryError> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(c), None, None) if !c.is_empty() => Ok(Path::column(c)),
            (Some(r), Some(c), None) if !r.is_empty() && !c.is_empty() => Ok(Path::joined(r, c)),
            _ => Err(QueryError::Unsupported(format!("attribute path `{s}`"))),
        }
    }

    pub fn is_joined(&self) -> bool {
        self.relation.is_some()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(r) => write!(f, "{r}.{}", self.column),
            None => f.write_str(&self.column),
        }
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        match s.split_once('.') {
            Some((r, c)) => Path::joined(r, c),
            None => Path::column(s),
        }
    }
}

/// The right-hand side of a predicate: a literal or a placeholder bound per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(ParamValue),
    /// 1-based positional parameter (`?1`, or the n-th derived-query argument).
    Positional(usize),
    Named(String),
}

impl Operand {
    fn resolve(&self, params: &Params) -> Result<ParamValue, QueryError> {
        match self {
            Operand::Value(v) => Ok(v.clone()),
            Operand::Positional(i) => params
                .positional
                .get(i.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| QueryError::MissingParameter(format!("?{i}"))),
            Operand::Named(n) => params
                .named
                .iter()
                .find(|(k, _)| k == n)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| QueryError::MissingParameter(n.clone())),
        }
    }

    fn is_bound(&self) -> bool {
        matches!(self, Operand::Value(_))
    }
}

macro_rules! impl_operand_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Operand {
                fn from(v: $t) -> Self {
                    Operand::Value(v.into())
                }
            }
        )*
    };
}

impl_operand_from!(ParamValue, String, &str, i32, i64, f64, bool);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

/// Wildcards added around a bound `like` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affix {
    /// The value is the full pattern.
    Exact,
    Starting,
    Ending,
    Containing,
}

/// Escape character for `like` patterns; engines honour it as `ESCAPE '\\'`.
pub const LIKE_ESCAPE: char = '\\';

impl Affix {
    /// The `like` pattern for `value`. Except for `Exact`, the value is matched
    /// literally: `%`, `_` and the escape character in it are escaped.
    pub fn apply(self, value: &str) -> String {
        match self {
            Affix::Exact => value.to_string(),
            Affix::Starting => format!("{}%", escape_like(value)),
            Affix::Ending => format!("%{}", escape_like(value)),
            Affix::Containing => format!("%{}%", escape_like(value)),
        }
    }
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == LIKE_ESCAPE || c == '%' || c == '_' {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        path: Path,
        op: CompareOp,
        value: Operand,
    },
    Between {
        path: Path,
        low: Operand,
        high: Operand,
    },
    In {
        path: Path,
        values: Operand,
        negated: bool,
    },
    Null {
        path: Path,
        negated: bool,
    },
    Like {
        path: Path,
        pattern: Operand,
        affix: Affix,
        negated: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(path: impl Into<Path>, op: CompareOp, value: impl Into<Operand>) -> Self {
        Predicate::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(path: impl Into<Path>, value: impl Into<Operand>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::And(v) => v,
            p => vec![p],
        };
        match other {
            Predicate::And(v) => parts.extend(v),
            p => parts.push(p),
        }
        Predicate::And(parts)
    }

    /// Disjunction, flattening nested `Or`s.
    pub fn or(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::Or(v) => v,
            p => vec![p],
        };
        match other {
            Predicate::Or(v) => parts.extend(v),
            p => parts.push(p),
        }
        Predicate::Or(parts)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Predicate::Not(inner) => *inner,
            p => Predicate::Not(Box::new(p)),
        }
    }

    /// Every attribute path referenced by this predicate.
    pub fn paths(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Predicate::Compare { path, .. }
            | Predicate::Between { path, .. }
            | Predicate::In { path, .. }
            | Predicate::Null { path, .. }
            | Predicate::Like { path, .. } => out.push(path),
            Predicate::And(ps) | Predicate::Or(ps) => {
                ps.iter().for_each(|p| p.collect_paths(out));
            }
            Predicate::Not(p) => p.collect_paths(out),
        }
    }

    /// Replace every placeholder with its argument. `like` affixes are folded into the
    /// pattern, so a bound predicate only contains `Affix::Exact`.
    pub fn bind(&self, params: &Params) -> Result<Predicate, QueryError> {
        Ok(match self {
            Predicate::Compare { path, op, value } => Predicate::Compare {
                path: path.clone(),
                op: *op,
                value: Operand::Value(value.resolve(params)?),
            },
            Predicate::Between { path, low, high } => Predicate::Between {
                path: path.clone(),
                low: Operand::Value(low.resolve(params)?),
                high: Operand::Value(high.resolve(params)?),
            },
            Predicate::In {
                path,
                values,
                negated,
            } => {
                let list = match values.resolve(params)? {
                    l @ ParamValue::List(_) => l,
                    single => ParamValue::List(vec![single]),
                };
                Predicate::In {
                    path: path.clone(),
                    values: Operand::Value(list),
                    negated: *negated,
                }
            }
            Predicate::Null { .. } => self.clone(),
            Predicate::Like {
                path,
                pattern,
                affix,
                negated,
            } => {
                let value = match pattern.resolve(params)? {
                    ParamValue::String(s) => ParamValue::String(affix.apply(&s)),
                    other => other,
                };
                Predicate::Like {
                    path: path.clone(),
                    pattern: Operand::Value(value),
                    affix: Affix::Exact,
                    negated: *negated,
                }
            }
            Predicate::And(ps) => {
                Predicate::And(ps.iter().map(|p| p.bind(params)).collect::<Result<_, _>>()?)
            }
            Predicate::Or(ps) => {
                Predicate::Or(ps.iter().map(|p| p.bind(params)).collect::<Result<_, _>>()?)
            }
            Predicate::Not(p) => Predicate::Not(Box::new(p.bind(params)?)),
        })
    }

    /// True when no placeholder remains.
    pub fn is_bound(&self) -> bool {
        match self {
            Predicate::Compare { value, .. } => value.is_bound(),
            Predicate::Between { low, high, .. } => low.is_bound() && high.is_bound(),
            Predicate::In { values, .. } => values.is_bound(),
            Predicate::Null { .. } => true,
            Predicate::Like { pattern, .. } => pattern.is_bound(),
            Predicate::And(ps) | Predicate::Or(ps) => ps.iter().all(Predicate::is_bound),
            Predicate::Not(p) => p.is_bound(),
        }
    }
}

/// Arguments for one query execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    positional: Vec<ParamValue>,
    named: Vec<(String, ParamValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: Vec<ParamValue>) -> Self {
        Self {
            positional: values,
            named: Vec::new(),
        }
    }

    /// Method arguments, reachable both by position and by parameter name.
    pub fn from_args(names: &[&str], values: Vec<ParamValue>) -> Self {
        let named = names
            .iter()
            .zip(values.iter())
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect();
        Self {
            positional: values,
            named,
        }
    }

    pub fn push(mut self, value: impl Into<ParamValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.named.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.named.push((name, value)),
        }
        self
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    pub fn has_named(&self, name: &str) -> bool {
        self.named.iter().any(|(k, _)| k == name)
    }

    pub fn resolve(&self, operand: &Operand) -> Result<ParamValue, QueryError> {
        operand.resolve(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub relation: String,
    pub kind: JoinKind,
    /// Include the related columns in entity results so `Ref` fields arrive loaded.
    pub fetch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// All root columns, plus the columns of fetch-joined relations.
    Entity,
    /// Exactly these paths, named by their display form (`username`, `team.name`).
    Columns(Vec<Path>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    None,
    PessimisticRead,
    PessimisticWrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub entity: EntityMeta,
    pub selection: Selection,
    pub joins: Vec<Join>,
    pub filter: Option<Predicate>,
    pub sort: Sort,
    pub limit: Option<u64>,
    pub offset: u64,
    pub distinct: bool,
    pub lock: LockMode,
}

impl SelectQuery {
    pub fn new(entity: EntityMeta) -> Self {
        Self {
            entity,
            selection: Selection::Entity,
            joins: Vec::new(),
            filter: None,
            sort: Sort::unsorted(),
            limit: None,
            offset: 0,
            distinct: false,
            lock: LockMode::None,
        }
    }

    /// Add a restriction, and-ed with any existing one.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn filter_opt(self, predicate: Option<Predicate>) -> Self {
        match predicate {
            Some(p) => self.filter(p),
            None => self,
        }
    }

    pub fn sorted(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    pub fn columns(mut self, paths: Vec<Path>) -> Self {
        self.selection = Selection::Columns(paths);
        self
    }

    pub fn join(mut self, relation: impl Into<String>, kind: JoinKind) -> Self {
        let relation = relation.into();
        match self.joins.iter_mut().find(|j| j.relation == relation) {
            Some(j) => {
                if kind == JoinKind::Left {
                    j.kind = JoinKind::Left;
                }
            }
            None => self.joins.push(Join {
                relation,
                kind,
                fetch: false,
            }),
        }
        self
    }

    /// Eagerly load a relation. Uses a left join so rows without the relation survive.
    pub fn fetch(mut self, relation: impl Into<String>) -> Self {
        let relation = relation.into();
        match self.joins.iter_mut().find(|j| j.relation == relation) {
            Some(j) => j.fetch = true,
            None => self.joins.push(Join {
                relation,
                kind: JoinKind::Left,
                fetch: true,
            }),
        }
        self
    }

    /// Explicit joins plus an implicit join for every referenced relation that is not
    /// joined explicitly. Filter paths join inner; paths used only by the selection or
    /// the sort join left, so they never drop rows.
    pub fn effective_joins(&self) -> Vec<Join> {
        let mut joins = self.joins.clone();
        let mut referenced: Vec<(&Path, JoinKind)> = Vec::new();
        if let Some(f) = &self.filter {
            referenced.extend(f.paths().into_iter().map(|p| (p, JoinKind::Inner)));
        }
        if let Selection::Columns(cols) = &self.selection {
            referenced.extend(cols.iter().map(|p| (p, JoinKind::Left)));
        }
        referenced.extend(self.sort.orders().iter().map(|o| (&o.path, JoinKind::Left)));
        for (path, kind) in referenced {
            if let Some(rel) = &path.relation {
                if !joins.iter().any(|j| &j.relation == rel) {
                    joins.push(Join {
                        relation: rel.clone(),
                        kind,
                        fetch: false,
                    });
                }
            }
        }
        joins
    }

    /// Check every path and join against the entity metadata.
    pub fn validate(&self) -> Result<(), QueryError> {
        for join in &self.joins {
            if self.entity.relation(&join.relation).is_none() {
                return Err(QueryError::UnknownRelation {
                    entity: self.entity.name.to_string(),
                    relation: join.relation.clone(),
                });
            }
        }
        if let Some(f) = &self.filter {
            for p in f.paths() {
                self.entity.resolve(p)?;
            }
        }
        if let Selection::Columns(cols) = &self.selection {
            for p in cols {
                self.entity.resolve(p)?;
            }
        }
        for o in self.sort.orders() {
            self.entity.resolve(&o.path)?;
        }
        Ok(())
    }

    pub fn bind(&self, params: &Params) -> Result<SelectQuery, QueryError> {
        let mut q = self.clone();
        q.filter = self.filter.as_ref().map(|f| f.bind(params)).transpose()?;
        Ok(q)
    }

    pub fn to_count(&self) -> CountQuery {
        CountQuery {
            entity: self.entity,
            joins: self.joins.clone(),
            filter: self.filter.clone(),
        }
    }
}

/// Row count for an entity, optionally restricted.
#[derive(Debug, Clone, PartialEq)]
pub struct CountQuery {
    pub entity: EntityMeta,
    pub joins: Vec<Join>,
    pub filter: Option<Predicate>,
}

impl CountQuery {
    pub fn new(entity: EntityMeta) -> Self {
        Self {
            entity,
            joins: Vec::new(),
            filter: None,
        }
    }

    /// Selecting query with the same rows, used by engines that count by scanning.
    pub fn as_select(&self) -> SelectQuery {
        let mut q = SelectQuery::new(self.entity);
        q.joins = self.joins.clone();
        q.filter = self.filter.clone();
        q
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetExpr {
    Value(Operand),
    /// `column + operand`
    Add(String, Operand),
    /// `column - operand`
    Sub(String, Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: SetExpr,
}

impl Assignment {
    fn bind(&self, params: &Params) -> Result<Assignment, QueryError> {
        let value = match &self.value {
            SetExpr::Value(o) => SetExpr::Value(Operand::Value(o.resolve(params)?)),
            SetExpr::Add(c, o) => SetExpr::Add(c.clone(), Operand::Value(o.resolve(params)?)),
            SetExpr::Sub(c, o) => SetExpr::Sub(c.clone(), Operand::Value(o.resolve(params)?)),
        };
        Ok(Assignment {
            column: self.column.clone(),
            value,
        })
    }
}

/// Set-based update over root columns. Bypasses the persistence context.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    pub entity: EntityMeta,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Predicate>,
}

impl BulkUpdate {
    pub fn bind(&self, params: &Params) -> Result<BulkUpdate, QueryError> {
        Ok(BulkUpdate {
            entity: self.entity,
            assignments: self
                .assignments
                .iter()
                .map(|a| a.bind(params))
                .collect::<Result<_, _>>()?,
            filter: self.filter.as_ref().map(|f| f.bind(params)).transpose()?,
        })
    }
}

/// Set-based delete over root columns. Bypasses the persistence context.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDelete {
    pub entity: EntityMeta,
    pub filter: Option<Predicate>,
}

impl BulkDelete {
    pub fn bind(&self, params: &Params) -> Result<BulkDelete, QueryError> {
        Ok(BulkDelete {
            entity: self.entity,
            filter: self.filter.as_ref().map(|f| f.bind(params)).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::Sort;
    use crate::test_entities::member_meta;

    #[test]
    fn and_or_flatten() {
        let p = Predicate::eq("a", 1).and(Predicate::eq("b", 2)).and(Predicate::eq("c", 3));
        match p {
            Predicate::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        let q = Predicate::eq("a", 1).or(Predicate::eq("b", 2).or(Predicate::eq("c", 3)));
        assert!(matches!(q, Predicate::Or(ref v) if v.len() == 3));
        assert_eq!(Predicate::eq("a", 1).not().not(), Predicate::eq("a", 1));
    }

    #[test]
    fn bind_resolves_placeholders_and_folds_affixes() {
        let p = Predicate::compare("age", CompareOp::Gt, Operand::Positional(2)).and(
            Predicate::Like {
                path: Path::column("username"),
                pattern: Operand::Named("name".into()),
                affix: Affix::Starting,
                negated: false,
            },
        );
        assert!(!p.is_bound());
        let params = Params::new().push("ignored").push(15).bind("name", "mem");
        let bound = p.bind(&params).unwrap();
        assert!(bound.is_bound());
        let Predicate::And(parts) = bound else {
            panic!("expected and")
        };
        assert_eq!(parts[0], Predicate::compare("age", CompareOp::Gt, 15));
        assert!(matches!(
            &parts[1],
            Predicate::Like { pattern: Operand::Value(ParamValue::String(s)), affix: Affix::Exact, .. } if s == "mem%"
        ));
    }

    #[test]
    fn missing_parameters_are_reported() {
        let p = Predicate::eq("username", Operand::Named("username".into()));
        assert_eq!(
            p.bind(&Params::new()).unwrap_err(),
            QueryError::MissingParameter("username".into())
        );
        let p = Predicate::eq("username", Operand::Positional(1));
        assert!(p.bind(&Params::new()).is_err());
    }

    #[test]
    fn in_binds_scalar_as_singleton_list() {
        let p = Predicate::In {
            path: Path::column("username"),
            values: Operand::Positional(1),
            negated: false,
        };
        let bound = p.bind(&Params::new().push("a")).unwrap();
        assert!(matches!(
            bound,
            Predicate::In { values: Operand::Value(ParamValue::List(ref l)), .. } if l.len() == 1
        ));
    }

    #[test]
    fn implicit_joins_for_relation_paths() {
        let q = SelectQuery::new(member_meta())
            .filter(Predicate::eq("team.name", "teamA"))
            .sorted(Sort::desc("username"));
        let joins = q.effective_joins();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].kind, JoinKind::Inner);
        assert!(!joins[0].fetch);

        let fetched = SelectQuery::new(member_meta())
            .fetch("team")
            .filter(Predicate::eq("team.name", "teamA"));
        let joins = fetched.effective_joins();
        assert_eq!(joins.len(), 1);
        assert!(joins[0].fetch);
        assert_eq!(joins[0].kind, JoinKind::Left);
    }

    #[test]
    fn affixes_match_the_value_literally() {
        assert_eq!(Affix::Starting.apply("a_"), "a\\_%");
        assert_eq!(Affix::Ending.apply("50%"), "%50\\%");
        assert_eq!(Affix::Containing.apply("a\\b"), "%a\\\\b%");
        assert_eq!(Affix::Exact.apply("a_%"), "a_%");
    }

    #[test]
    fn sort_and_selection_paths_join_left() {
        let sorted = SelectQuery::new(member_meta()).sorted(Sort::asc("team.name"));
        let joins = sorted.effective_joins();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].kind, JoinKind::Left);

        let selected = SelectQuery::new(member_meta()).columns(vec![Path::joined("team", "name")]);
        assert_eq!(selected.effective_joins()[0].kind, JoinKind::Left);

        // A filter on the same relation still restricts rows.
        let filtered = sorted.filter(Predicate::eq("team.name", "teamA"));
        assert_eq!(filtered.effective_joins()[0].kind, JoinKind::Inner);
    }

    #[test]
    fn validate_rejects_unknown_paths() {
        let q = SelectQuery::new(member_meta()).filter(Predicate::eq("nickname", "x"));
        assert!(matches!(
            q.validate(),
            Err(QueryError::UnknownProperty { .. })
        ));
        let q = SelectQuery::new(member_meta()).fetch("club");
        assert!(matches!(q.validate(), Err(QueryError::UnknownRelation { .. })));
        assert!(SelectQuery::new(member_meta()).fetch("team").validate().is_ok());
    }

    #[test]
    fn path_parsing() {
        assert_eq!(Path::parse("team.name").unwrap(), Path::joined("team", "name"));
        assert_eq!(Path::parse("age").unwrap().to_string(), "age");
        assert!(Path::parse("a.b.c").is_err());
        assert!(Path::parse("").is_err());
    }
}
