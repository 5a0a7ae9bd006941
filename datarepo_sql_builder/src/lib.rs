#![forbid(unsafe_code)]
//! Render datarepo query values to SQL text plus ordered parameters.
//!
//! Feature flags select placeholder style:
//! - `dollar`: $1, $2, ...
//!
//! Default (no feature): ?
//!
//! Selects alias the root table `t0` and joined relations `j1`, `j2`, ... in join
//! order. Result columns are named the way engines name record columns: plain column
//! names for the root (`username`, `team_id`) and `relation.column` for joined ones
//! (`team.name`). See [`output_columns`].

use datarepo_core::paging::Direction;
use datarepo_core::query::{
    Affix, BulkDelete, BulkUpdate, CountQuery, Join, JoinKind, LockMode, Operand, Path,
    Predicate, SelectQuery, Selection, SetExpr, LIKE_ESCAPE,
};
use datarepo_core::{EntityMeta, ParamValue, QueryError, Record};

/// Placeholder representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Dollar,   // $1, $2, ...
    Question, // ?
}

/// Style selected by the crate features.
pub fn placeholder_style() -> Placeholder {
    #[cfg(feature = "dollar")]
    return Placeholder::Dollar;

    #[cfg(not(feature = "dollar"))]
    return Placeholder::Question;
}

/// SQL text with its parameters in placeholder order.
pub type Statement = (String, Vec<ParamValue>);

/// Builds statements in one placeholder style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlBuilder {
    style: Placeholder,
}

impl Default for SqlBuilder {
    fn default() -> Self {
        Self::new(placeholder_style())
    }
}

impl SqlBuilder {
    pub fn new(style: Placeholder) -> Self {
        Self { style }
    }

    pub fn style(&self) -> Placeholder {
        self.style
    }

    /// `SELECT ... FROM <table> t0 [JOIN ...] [WHERE ...] [ORDER BY ...] [LIMIT/OFFSET]`.
    pub fn select(&self, query: &SelectQuery) -> Result<Statement, QueryError> {
        let mut w = Writer::new(self.style, query.entity, query.effective_joins(), true)?;
        let items: Vec<String> = select_items(query, &w.joins)?
            .into_iter()
            .map(|(expr, name)| format!("{expr} AS \"{name}\""))
            .collect();
        w.sql.push_str("SELECT ");
        if query.distinct {
            w.sql.push_str("DISTINCT ");
        }
        w.sql.push_str(&items.join(", "));
        w.from_clause();
        if let Some(filter) = &query.filter {
            w.sql.push_str(" WHERE ");
            w.predicate(filter)?;
        }
        let orders = query
            .sort
            .orders()
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                w.column(&o.path).map(|c| format!("{c} {dir}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if !orders.is_empty() {
            w.sql.push_str(" ORDER BY ");
            w.sql.push_str(&orders.join(", "));
        }
        match (query.limit, query.offset, self.style) {
            (Some(l), 0, _) => w.sql.push_str(&format!(" LIMIT {l}")),
            (Some(l), off, _) => w.sql.push_str(&format!(" LIMIT {l} OFFSET {off}")),
            (None, 0, _) => {}
            // SQLite only accepts OFFSET after a LIMIT.
            (None, off, Placeholder::Question) => w.sql.push_str(&format!(" LIMIT -1 OFFSET {off}")),
            (None, off, Placeholder::Dollar) => w.sql.push_str(&format!(" OFFSET {off}")),
        }
        // Row locks are only expressible in the Postgres dialect; SQLite locks per transaction.
        if self.style == Placeholder::Dollar {
            match query.lock {
                LockMode::None => {}
                LockMode::PessimisticRead => w.sql.push_str(" FOR SHARE"),
                LockMode::PessimisticWrite => w.sql.push_str(" FOR UPDATE"),
            }
        }
        Ok(w.finish())
    }

    /// `SELECT COUNT(*) FROM <table> t0 [JOIN ...] [WHERE ...]`.
    pub fn count(&self, query: &CountQuery) -> Result<Statement, QueryError> {
        let joins = query.as_select().effective_joins();
        let mut w = Writer::new(self.style, query.entity, joins, true)?;
        w.sql.push_str("SELECT COUNT(*)");
        w.from_clause();
        if let Some(filter) = &query.filter {
            w.sql.push_str(" WHERE ");
            w.predicate(filter)?;
        }
        Ok(w.finish())
    }

    /// `INSERT INTO <table> (<cols>) VALUES (<placeholders>)`. A null key column is left
    /// out so the database generates it.
    /// When feature `returning` is enabled, this appends `RETURNING <id_column>`.
    pub fn insert(&self, meta: &EntityMeta, values: &Record) -> Statement {
        let mut cols = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len());
        for (col, v) in values.iter() {
            if col == meta.id_column && v.is_null() {
                continue;
            }
            cols.push(col.to_string());
            params.push(v.clone());
        }
        let phs: Vec<String> = (1..=params.len())
            .map(|i| placeholder_n(self.style, i))
            .collect();
        #[allow(unused_mut)]
        let mut sql = if cols.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", meta.table)
        } else {
            format!(
                "INSERT INTO {table} ({cols}) VALUES ({vals})",
                table = meta.table,
                cols = cols.join(", "),
                vals = phs.join(", ")
            )
        };
        #[cfg(feature = "returning")]
        {
            sql.push_str(" RETURNING ");
            sql.push_str(meta.id_column);
        }
        (sql, params)
    }

    /// `UPDATE <table> SET <col1> = <ph1>, ... WHERE <id> = <phN>`. The key column in
    /// `values` is ignored; with nothing else to set, the key is assigned to itself.
    pub fn update_by_id(&self, meta: &EntityMeta, key: &ParamValue, values: &Record) -> Statement {
        let mut assignments = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len() + 1);
        for (col, v) in values.iter().filter(|(c, _)| *c != meta.id_column) {
            params.push(v.clone());
            assignments.push(format!("{col} = {}", placeholder_n(self.style, params.len())));
        }
        if assignments.is_empty() {
            // Key-only entity: still report whether the row exists.
            assignments.push(format!("{id} = {id}", id = meta.id_column));
        }
        params.push(key.clone());
        let sql = format!(
            "UPDATE {table} SET {set_clause} WHERE {id} = {ph}",
            table = meta.table,
            set_clause = assignments.join(", "),
            id = meta.id_column,
            ph = placeholder_n(self.style, params.len())
        );
        (sql, params)
    }

    /// `DELETE FROM <table> WHERE <id> = <ph>`.
    pub fn delete_by_id(&self, meta: &EntityMeta, key: &ParamValue) -> Statement {
        let sql = format!(
            "DELETE FROM {table} WHERE {id} = {ph}",
            table = meta.table,
            id = meta.id_column,
            ph = placeholder_n(self.style, 1)
        );
        (sql, vec![key.clone()])
    }

    /// `UPDATE <table> SET <col> = <expr>, ... [WHERE ...]` over root columns.
    pub fn bulk_update(&self, stmt: &BulkUpdate) -> Result<Statement, QueryError> {
        let mut w = Writer::new(self.style, stmt.entity, Vec::new(), false)?;
        w.sql.push_str("UPDATE ");
        w.sql.push_str(stmt.entity.table);
        w.sql.push_str(" SET ");
        for (i, a) in stmt.assignments.iter().enumerate() {
            if i > 0 {
                w.sql.push_str(", ");
            }
            w.sql.push_str(&a.column);
            w.sql.push_str(" = ");
            match &a.value {
                SetExpr::Value(o) => w.operand(o)?,
                SetExpr::Add(c, o) => {
                    w.sql.push_str(c);
                    w.sql.push_str(" + ");
                    w.operand(o)?;
                }
                SetExpr::Sub(c, o) => {
                    w.sql.push_str(c);
                    w.sql.push_str(" - ");
                    w.operand(o)?;
                }
            }
        }
        if let Some(filter) = &stmt.filter {
            w.sql.push_str(" WHERE ");
            w.predicate(filter)?;
        }
        Ok(w.finish())
    }

    /// `DELETE FROM <table> [WHERE ...]` over root columns.
    pub fn bulk_delete(&self, stmt: &BulkDelete) -> Result<Statement, QueryError> {
        let mut w = Writer::new(self.style, stmt.entity, Vec::new(), false)?;
        w.sql.push_str("DELETE FROM ");
        w.sql.push_str(stmt.entity.table);
        if let Some(filter) = &stmt.filter {
            w.sql.push_str(" WHERE ");
            w.predicate(filter)?;
        }
        Ok(w.finish())
    }
}

/// Names of the result columns [`SqlBuilder::select`] produces, in order.
pub fn output_columns(query: &SelectQuery) -> Result<Vec<String>, QueryError> {
    let joins = query.effective_joins();
    Ok(select_items(query, &joins)?
        .into_iter()
        .map(|(_, name)| name)
        .collect())
}

/// (expression, output name) pairs; the expression uses the `t0`/`jN` aliases.
fn select_items(query: &SelectQuery, joins: &[Join]) -> Result<Vec<(String, String)>, QueryError> {
    let meta = &query.entity;
    match &query.selection {
        Selection::Entity => {
            let mut items: Vec<(String, String)> = meta
                .columns
                .iter()
                .map(|c| (format!("t0.{c}"), c.to_string()))
                .collect();
            for (i, join) in joins.iter().enumerate().filter(|(_, j)| j.fetch) {
                let rel = relation(meta, &join.relation)?;
                items.extend(
                    rel.columns
                        .iter()
                        .map(|c| (format!("j{}.{c}", i + 1), format!("{}.{c}", rel.name))),
                );
            }
            Ok(items)
        }
        Selection::Columns(paths) => paths
            .iter()
            .map(|p| Ok((qualified(meta, joins, p)?, p.to_string())))
            .collect(),
    }
}

fn relation(meta: &EntityMeta, name: &str) -> Result<&'static datarepo_core::Relation, QueryError> {
    meta.relation(name).ok_or_else(|| QueryError::UnknownRelation {
        entity: meta.name.to_string(),
        relation: name.to_string(),
    })
}

fn qualified(meta: &EntityMeta, joins: &[Join], path: &Path) -> Result<String, QueryError> {
    meta.resolve(path)?;
    match &path.relation {
        None => Ok(format!("t0.{}", path.column)),
        Some(rel) => joins
            .iter()
            .position(|j| &j.relation == rel)
            .map(|i| format!("j{}.{}", i + 1, path.column))
            .ok_or_else(|| QueryError::UnknownRelation {
                entity: meta.name.to_string(),
                relation: rel.clone(),
            }),
    }
}

fn placeholder_n(ph: Placeholder, n: usize) -> String {
    match ph {
        Placeholder::Dollar => format!("${}", n),
        Placeholder::Question => "?".to_string(),
    }
}

struct Writer {
    style: Placeholder,
    meta: EntityMeta,
    joins: Vec<Join>,
    /// Root columns are written as `t0.col`; bulk statements write them bare.
    aliased: bool,
    sql: String,
    params: Vec<ParamValue>,
}

impl Writer {
    fn new(
        style: Placeholder,
        meta: EntityMeta,
        joins: Vec<Join>,
        aliased: bool,
    ) -> Result<Self, QueryError> {
        for j in &joins {
            relation(&meta, &j.relation)?;
        }
        Ok(Self {
            style,
            meta,
            joins,
            aliased,
            sql: String::new(),
            params: Vec::new(),
        })
    }

    fn finish(self) -> Statement {
        (self.sql, self.params)
    }

    fn from_clause(&mut self) {
        self.sql.push_str(" FROM ");
        self.sql.push_str(self.meta.table);
        self.sql.push_str(" t0");
        for (i, join) in self.joins.iter().enumerate() {
            // Validated in `new`.
            let Some(rel) = self.meta.relation(&join.relation) else {
                continue;
            };
            let kw = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            self.sql.push_str(&format!(
                " {kw} {table} j{n} ON j{n}.{id} = t0.{fk}",
                table = rel.table,
                n = i + 1,
                id = rel.id_column,
                fk = rel.column
            ));
        }
    }

    fn column(&self, path: &Path) -> Result<String, QueryError> {
        if self.aliased {
            return qualified(&self.meta, &self.joins, path);
        }
        if path.is_joined() {
            return Err(QueryError::Unsupported(format!(
                "joined attribute `{path}` in a bulk statement"
            )));
        }
        self.meta.resolve(path)?;
        Ok(path.column.clone())
    }

    fn push_param(&mut self, value: ParamValue) {
        self.params.push(value);
        self.sql.push_str(&placeholder_n(self.style, self.params.len()));
    }

    fn value(operand: &Operand) -> Result<ParamValue, QueryError> {
        match operand {
            Operand::Value(v) => Ok(v.clone()),
            Operand::Positional(i) => Err(QueryError::MissingParameter(format!("?{i}"))),
            Operand::Named(n) => Err(QueryError::MissingParameter(n.clone())),
        }
    }

    fn operand(&mut self, operand: &Operand) -> Result<(), QueryError> {
        let v = Self::value(operand)?;
        self.push_param(v);
        Ok(())
    }

    fn predicate(&mut self, p: &Predicate) -> Result<(), QueryError> {
        match p {
            Predicate::Compare { path, op, value } => {
                let col = self.column(path)?;
                self.sql.push_str(&format!("{col} {} ", op.as_sql()));
                self.operand(value)?;
            }
            Predicate::Between { path, low, high } => {
                let col = self.column(path)?;
                self.sql.push_str(&format!("{col} BETWEEN "));
                self.operand(low)?;
                self.sql.push_str(" AND ");
                self.operand(high)?;
            }
            Predicate::In {
                path,
                values,
                negated,
            } => {
                let col = self.column(path)?;
                let items = match Self::value(values)? {
                    ParamValue::List(items) => items,
                    single => vec![single],
                };
                if items.is_empty() {
                    self.sql.push_str(if *negated { "1 = 1" } else { "1 = 0" });
                    return Ok(());
                }
                self.sql.push_str(&col);
                self.sql.push_str(if *negated { " NOT IN (" } else { " IN (" });
                for (i, v) in items.into_iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.push_param(v);
                }
                self.sql.push(')');
            }
            Predicate::Null { path, negated } => {
                let col = self.column(path)?;
                let tail = if *negated { "IS NOT NULL" } else { "IS NULL" };
                self.sql.push_str(&format!("{col} {tail}"));
            }
            Predicate::Like {
                path,
                pattern,
                affix,
                negated,
            } => {
                let col = self.column(path)?;
                let pattern = match (Self::value(pattern)?, affix) {
                    (ParamValue::String(s), a) if *a != Affix::Exact => ParamValue::String(a.apply(&s)),
                    (v, _) => v,
                };
                let kw = if *negated { "NOT LIKE" } else { "LIKE" };
                self.sql.push_str(&format!("{col} {kw} "));
                self.push_param(pattern);
                self.sql.push_str(&format!(" ESCAPE '{LIKE_ESCAPE}'"));
            }
            Predicate::And(parts) => self.group(parts, " AND ", "1 = 1")?,
            Predicate::Or(parts) => self.group(parts, " OR ", "1 = 0")?,
            Predicate::Not(inner) => {
                self.sql.push_str("NOT (");
                self.predicate(inner)?;
                self.sql.push(')');
            }
        }
        Ok(())
    }

    fn group(&mut self, parts: &[Predicate], sep: &str, empty: &str) -> Result<(), QueryError> {
        if parts.is_empty() {
            self.sql.push_str(empty);
            return Ok(());
        }
        self.sql.push('(');
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(sep);
            }
            self.predicate(part)?;
        }
        self.sql.push(')');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datarepo_core::paging::Sort;
    use datarepo_core::query::{Assignment, CompareOp};
    use datarepo_core::Relation;

    const TEAM_COLUMNS: &[&str] = &["id", "name"];
    const TEAM_FINDABLE: &[(&str, &str)] = &[("name", "String")];
    const RELATIONS: &[Relation] = &[Relation {
        name: "team",
        column: "team_id",
        entity: "Team",
        table: "teams",
        id_column: "id",
        columns: TEAM_COLUMNS,
        findable: TEAM_FINDABLE,
    }];

    fn members() -> EntityMeta {
        EntityMeta {
            name: "Member",
            table: "members",
            id_column: "id",
            columns: &["id", "username", "age", "team_id"],
            findable: &[
                ("username", "String"),
                ("age", "i32"),
                ("team_id", "Ref<Team>"),
            ],
            relations: RELATIONS,
        }
    }

    fn q() -> SqlBuilder {
        SqlBuilder::new(Placeholder::Question)
    }

    fn pg() -> SqlBuilder {
        SqlBuilder::new(Placeholder::Dollar)
    }

    #[test]
    fn select_all_columns() {
        let (sql, params) = q().select(&SelectQuery::new(members())).unwrap();
        assert_eq!(
            sql,
            "SELECT t0.id AS \"id\", t0.username AS \"username\", t0.age AS \"age\", \
             t0.team_id AS \"team_id\" FROM members t0"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn filter_sort_and_paging() {
        let query = SelectQuery::new(members())
            .filter(Predicate::eq("username", "AAA"))
            .filter(Predicate::compare("age", CompareOp::Gt, 15))
            .sorted(Sort::desc("username"))
            .limit(3)
            .offset(6);
        let (sql, params) = pg().select(&query).unwrap();
        assert!(sql.ends_with(
            "FROM members t0 WHERE (t0.username = $1 AND t0.age > $2) \
             ORDER BY t0.username DESC LIMIT 3 OFFSET 6"
        ));
        assert_eq!(params, vec![ParamValue::from("AAA"), ParamValue::I32(15)]);
    }

    #[test]
    fn offset_without_limit_per_dialect() {
        let query = SelectQuery::new(members()).offset(5);
        assert!(q().select(&query).unwrap().0.ends_with(" LIMIT -1 OFFSET 5"));
        assert!(pg().select(&query).unwrap().0.ends_with("t0 OFFSET 5"));
    }

    #[test]
    fn relation_path_adds_inner_join() {
        let query = SelectQuery::new(members()).filter(Predicate::eq("team.name", "teamA"));
        let (sql, _) = q().select(&query).unwrap();
        assert!(sql.contains("FROM members t0 JOIN teams j1 ON j1.id = t0.team_id WHERE j1.name = ?"));
    }

    #[test]
    fn fetch_join_selects_related_columns() {
        let query = SelectQuery::new(members()).fetch("team");
        let (sql, _) = q().select(&query).unwrap();
        assert!(sql.contains("j1.name AS \"team.name\""));
        assert!(sql.contains("LEFT JOIN teams j1"));
        assert_eq!(
            output_columns(&query).unwrap(),
            vec!["id", "username", "age", "team_id", "team.id", "team.name"]
        );
    }

    #[test]
    fn projection_columns_are_named_by_path() {
        let query = SelectQuery::new(members())
            .columns(vec![Path::column("username"), Path::joined("team", "name")])
            .join("team", JoinKind::Left);
        let (sql, _) = q().select(&query).unwrap();
        assert_eq!(
            sql,
            "SELECT t0.username AS \"username\", j1.name AS \"team.name\" \
             FROM members t0 LEFT JOIN teams j1 ON j1.id = t0.team_id"
        );
    }

    #[test]
    fn in_lists_expand_and_empty_lists_are_constant() {
        let names = ParamValue::from(vec!["a", "b"]);
        let query = SelectQuery::new(members()).filter(Predicate::In {
            path: Path::column("username"),
            values: Operand::Value(names),
            negated: false,
        });
        let (sql, params) = pg().select(&query).unwrap();
        assert!(sql.ends_with("WHERE t0.username IN ($1, $2)"));
        assert_eq!(params.len(), 2);

        let empty = SelectQuery::new(members()).filter(Predicate::In {
            path: Path::column("username"),
            values: Operand::Value(ParamValue::List(vec![])),
            negated: true,
        });
        assert!(q().select(&empty).unwrap().0.ends_with("WHERE 1 = 1"));
    }

    #[test]
    fn like_applies_affix_and_not_wraps() {
        let p = Predicate::Like {
            path: Path::column("username"),
            pattern: Operand::Value("mem".into()),
            affix: Affix::Starting,
            negated: false,
        }
        .not();
        let (sql, params) = q().select(&SelectQuery::new(members()).filter(p)).unwrap();
        assert!(sql.ends_with("WHERE NOT (t0.username LIKE ? ESCAPE '\\')"));
        assert_eq!(params, vec![ParamValue::from("mem%")]);

        let literal = Predicate::Like {
            path: Path::column("username"),
            pattern: Operand::Value("a_".into()),
            affix: Affix::Starting,
            negated: false,
        };
        let (_, params) = q().select(&SelectQuery::new(members()).filter(literal)).unwrap();
        assert_eq!(params, vec![ParamValue::from("a\\_%")]);
    }

    #[test]
    fn unbound_parameter_is_rejected() {
        let query = SelectQuery::new(members()).filter(Predicate::eq("age", Operand::Named("age".into())));
        assert_eq!(
            q().select(&query).unwrap_err(),
            QueryError::MissingParameter("age".into())
        );
    }

    #[test]
    fn locks_only_in_dollar_dialect() {
        let query = SelectQuery::new(members()).lock(LockMode::PessimisticWrite);
        assert!(pg().select(&query).unwrap().0.ends_with(" FOR UPDATE"));
        assert!(!q().select(&query).unwrap().0.contains("FOR"));
        let read = SelectQuery::new(members()).lock(LockMode::PessimisticRead);
        assert!(pg().select(&read).unwrap().0.ends_with(" FOR SHARE"));
    }

    #[test]
    fn count_with_filter() {
        let mut cq = CountQuery::new(members());
        cq.filter = Some(Predicate::Null {
            path: Path::column("team_id"),
            negated: true,
        });
        let (sql, _) = q().count(&cq).unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM members t0 WHERE t0.team_id IS NOT NULL");
    }

    #[test]
    fn insert_skips_null_key() {
        let rec = Record::new()
            .with("id", ParamValue::Null)
            .with("username", "m1")
            .with("age", 10);
        let (sql, params) = pg().insert(&members(), &rec);
        assert!(sql.starts_with("INSERT INTO members (username, age) VALUES ($1, $2)"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn update_and_delete_by_id() {
        let rec = Record::new().with("id", 1_i64).with("username", "x").with("age", 3);
        let (sql, params) = pg().update_by_id(&members(), &ParamValue::I64(1), &rec);
        assert_eq!(sql, "UPDATE members SET username = $1, age = $2 WHERE id = $3");
        assert_eq!(params.last(), Some(&ParamValue::I64(1)));
        let (sql, _) = q().delete_by_id(&members(), &ParamValue::I64(1));
        assert_eq!(sql, "DELETE FROM members WHERE id = ?");

        let (sql, params) = q().update_by_id(&members(), &ParamValue::I64(1), &Record::new());
        assert_eq!(sql, "UPDATE members SET id = id WHERE id = ?");
        assert_eq!(params, vec![ParamValue::I64(1)]);
    }

    #[test]
    fn bulk_statements_use_bare_columns() {
        let stmt = BulkUpdate {
            entity: members(),
            assignments: vec![Assignment {
                column: "age".into(),
                value: SetExpr::Add("age".into(), Operand::Value(ParamValue::I32(1))),
            }],
            filter: Some(Predicate::compare("age", CompareOp::Ge, 20)),
        };
        let (sql, params) = pg().bulk_update(&stmt).unwrap();
        assert_eq!(sql, "UPDATE members SET age = age + $1 WHERE age >= $2");
        assert_eq!(params.len(), 2);

        let del = BulkDelete {
            entity: members(),
            filter: Some(Predicate::eq("team.name", "x")),
        };
        assert!(matches!(q().bulk_delete(&del), Err(QueryError::Unsupported(_))));
    }
}
