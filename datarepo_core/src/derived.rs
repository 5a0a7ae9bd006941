//! Queries derived from repository method names.
//!
//! A snake-case method name such as `find_by_username_and_age_greater_than` is split
//! into a subject (`find`), optional modifiers (`distinct`, `first3`, `top10`), a
//! predicate of `or`-separated `and`-groups, and an optional `order_by_` suffix.
//! Each predicate part names a property and an operator; properties of many-to-one
//! relations are reached by prefixing the relation name (`team_name`).

use crate::paging::{Direction, Order, Sort};
use crate::query::{Affix, CompareOp, CountQuery, Operand, Params, Path, Predicate, SelectQuery};
use crate::{ColumnKind, EntityMeta, Fetchable, Identifiable, ParamValue, QueryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Find,
    Count,
    Exists,
    Delete,
}

impl Subject {
    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "find" | "read" | "get" | "query" | "search" | "stream" => Some(Subject::Find),
            "count" => Some(Subject::Count),
            "exists" => Some(Subject::Exists),
            "delete" | "remove" => Some(Subject::Delete),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Subject::Find => "a find query",
            Subject::Count => "a count query",
            Subject::Exists => "an exists query",
            Subject::Delete => "a delete query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Compare(CompareOp),
    Between,
    IsNull,
    IsNotNull,
    Like(Affix, bool),
    In(bool),
    True,
    False,
}

impl Operator {
    fn accepts(self, kind: ColumnKind) -> bool {
        match self {
            Operator::Compare(CompareOp::Eq | CompareOp::Ne)
            | Operator::IsNull
            | Operator::IsNotNull
            | Operator::In(_) => true,
            Operator::Compare(_) | Operator::Between => kind.is_orderable(),
            Operator::Like(..) => matches!(kind, ColumnKind::Text | ColumnKind::Other),
            Operator::True | Operator::False => matches!(kind, ColumnKind::Bool | ColumnKind::Other),
        }
    }
}

/// Keyword suffixes, longest first so `greater_than_equal` wins over `greater_than`.
const OPERATORS: &[(&[&str], Operator)] = &[
    (&["greater", "than", "equal"], Operator::Compare(CompareOp::Ge)),
    (&["less", "than", "equal"], Operator::Compare(CompareOp::Le)),
    (&["is", "not", "null"], Operator::IsNotNull),
    (&["greater", "than"], Operator::Compare(CompareOp::Gt)),
    (&["less", "than"], Operator::Compare(CompareOp::Lt)),
    (&["not", "null"], Operator::IsNotNull),
    (&["is", "null"], Operator::IsNull),
    (&["not", "like"], Operator::Like(Affix::Exact, true)),
    (&["starting", "with"], Operator::Like(Affix::Starting, false)),
    (&["ending", "with"], Operator::Like(Affix::Ending, false)),
    (&["not", "containing"], Operator::Like(Affix::Containing, true)),
    (&["not", "in"], Operator::In(true)),
    (&["is", "not"], Operator::Compare(CompareOp::Ne)),
    (&["is", "true"], Operator::True),
    (&["is", "false"], Operator::False),
    (&["null"], Operator::IsNull),
    (&["before"], Operator::Compare(CompareOp::Lt)),
    (&["after"], Operator::Compare(CompareOp::Gt)),
    (&["between"], Operator::Between),
    (&["like"], Operator::Like(Affix::Exact, false)),
    (&["containing"], Operator::Like(Affix::Containing, false)),
    (&["in"], Operator::In(false)),
    (&["not"], Operator::Compare(CompareOp::Ne)),
    (&["true"], Operator::True),
    (&["false"], Operator::False),
    (&["is"], Operator::Compare(CompareOp::Eq)),
    (&["equals"], Operator::Compare(CompareOp::Eq)),
];

/// A parsed method-name query, bound per call with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedQuery {
    method: String,
    entity: EntityMeta,
    subject: Subject,
    distinct: bool,
    limit: Option<u64>,
    filter: Option<Predicate>,
    sort: Sort,
    arity: usize,
}

impl DerivedQuery {
    pub fn parse<T: Fetchable + Identifiable>(method: &str) -> Result<Self, QueryError> {
        Self::parse_with(EntityMeta::of::<T>(), method)
    }

    pub fn parse_with(entity: EntityMeta, method: &str) -> Result<Self, QueryError> {
        Parser { entity, method }.parse()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn entity(&self) -> &EntityMeta {
        &self.entity
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    pub fn filter(&self) -> Option<&Predicate> {
        self.filter.as_ref()
    }

    /// Number of arguments a call must supply.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Fail unless the subject is one of `allowed`.
    pub fn expect_subject(&self, allowed: &[Subject]) -> Result<(), QueryError> {
        if allowed.contains(&self.subject) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(|s| s.describe())
            .collect::<Vec<_>>()
            .join(" or ");
        Err(QueryError::ResultShape {
            query: self.method.clone(),
            expected,
            found: self.subject.describe().to_string(),
        })
    }

    pub fn expect_arity(&self, declared: usize) -> Result<(), QueryError> {
        if declared == self.arity {
            Ok(())
        } else {
            Err(QueryError::Arity {
                expected: self.arity,
                actual: declared,
            })
        }
    }

    fn bound_filter(&self, args: Vec<ParamValue>) -> Result<Option<Predicate>, QueryError> {
        if args.len() != self.arity {
            return Err(QueryError::Arity {
                expected: self.arity,
                actual: args.len(),
            });
        }
        let params = Params::positional(args);
        self.filter.as_ref().map(|f| f.bind(&params)).transpose()
    }

    /// Build the select for one call.
    pub fn bind(&self, args: Vec<ParamValue>) -> Result<SelectQuery, QueryError> {
        let mut query = SelectQuery::new(self.entity)
            .filter_opt(self.bound_filter(args)?)
            .sorted(self.sort.clone());
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        if self.subject == Subject::Exists {
            query = query.limit(1);
        }
        if self.distinct {
            query = query.distinct();
        }
        Ok(query)
    }

    pub fn bind_count(&self, args: Vec<ParamValue>) -> Result<CountQuery, QueryError> {
        let mut q = CountQuery::new(self.entity);
        q.filter = self.bound_filter(args)?;
        Ok(q)
    }
}

struct Parser<'a> {
    entity: EntityMeta,
    method: &'a str,
}

impl Parser<'_> {
    fn invalid(&self, reason: impl Into<String>) -> QueryError {
        QueryError::InvalidMethodName {
            method: self.method.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(&self) -> Result<DerivedQuery, QueryError> {
        if self.method.is_empty()
            || !self
                .method
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(self.invalid("expected a snake_case identifier"));
        }
        let words: Vec<&str> = self.method.split('_').collect();
        if words.iter().any(|w| w.is_empty()) {
            return Err(self.invalid("empty segment"));
        }
        let subject = Subject::from_keyword(words[0]).ok_or_else(|| {
            self.invalid(format!(
                "`{}` is not a query subject (find, read, get, query, search, stream, count, exists, delete, remove)",
                words[0]
            ))
        })?;

        let by = words.iter().position(|w| *w == "by");
        let modifiers = &words[1..by.unwrap_or(words.len())];
        let (distinct, limit) = self.modifiers(modifiers)?;
        if limit.is_some() && subject != Subject::Find {
            return Err(self.invalid("`first`/`top` only apply to find queries"));
        }

        let criteria: &[&str] = match by {
            Some(i) => &words[i + 1..],
            None => &[],
        };
        if by.is_some() && criteria.is_empty() {
            return Err(self.invalid("nothing follows `by`"));
        }

        let (predicate_words, order_words) = split_order_by(criteria);
        let mut arity = 0;
        let filter = if predicate_words.is_empty() {
            None
        } else {
            Some(self.predicate(predicate_words, &mut arity)?)
        };
        let sort = match order_words {
            Some(words) => self.order(words)?,
            None => Sort::unsorted(),
        };

        Ok(DerivedQuery {
            method: self.method.to_string(),
            entity: self.entity,
            subject,
            distinct,
            limit,
            filter,
            sort,
            arity,
        })
    }

    /// Words between the subject and `by`. Only `distinct`, `first[N]` and `top[N]` carry
    /// meaning; anything else (an entity name, a descriptive word) is ignored.
    fn modifiers(&self, words: &[&str]) -> Result<(bool, Option<u64>), QueryError> {
        let mut distinct = false;
        let mut limit = None;
        let mut i = 0;
        while i < words.len() {
            let w = words[i];
            if w == "distinct" {
                distinct = true;
            } else if let Some(rest) = w.strip_prefix("first").or_else(|| w.strip_prefix("top")) {
                let n = if !rest.is_empty() {
                    Some(rest)
                } else if words.get(i + 1).is_some_and(|n| n.chars().all(|c| c.is_ascii_digit())) {
                    i += 1;
                    Some(words[i])
                } else {
                    None
                };
                let n = match n {
                    Some(digits) => digits
                        .parse::<u64>()
                        .map_err(|_| self.invalid(format!("bad result limit `{w}`")))?,
                    None => 1,
                };
                if n == 0 {
                    return Err(self.invalid("result limit must be positive"));
                }
                limit = Some(n);
            }
            i += 1;
        }
        Ok((distinct, limit))
    }

    fn predicate(&self, words: &[&str], arity: &mut usize) -> Result<Predicate, QueryError> {
        let mut groups = Vec::new();
        for or_part in words.split(|w| *w == "or") {
            let mut parts = Vec::new();
            for and_part in or_part.split(|w| *w == "and") {
                if and_part.is_empty() {
                    return Err(self.invalid("dangling `and`/`or`"));
                }
                parts.push(self.part(and_part, arity)?);
            }
            groups.push(if parts.len() == 1 {
                parts.remove(0)
            } else {
                Predicate::And(parts)
            });
        }
        Ok(if groups.len() == 1 {
            groups.remove(0)
        } else {
            Predicate::Or(groups)
        })
    }

    fn part(&self, words: &[&str], arity: &mut usize) -> Result<Predicate, QueryError> {
        let (property, operator) = OPERATORS
            .iter()
            .find(|(suffix, _)| words.len() > suffix.len() && words.ends_with(suffix))
            .map(|(suffix, op)| (&words[..words.len() - suffix.len()], *op))
            .unwrap_or((words, Operator::Compare(CompareOp::Eq)));

        let path = self.property(property)?;
        let kind = self.entity.resolve(&path)?;
        if !operator.accepts(kind) {
            let op_name = words[property.len()..].join("_");
            return Err(QueryError::IncompatibleOperator {
                property: path.to_string(),
                operator: if op_name.is_empty() { "equals".into() } else { op_name },
                kind: kind.to_string(),
            });
        }

        let mut next = || {
            *arity += 1;
            Operand::Positional(*arity)
        };
        Ok(match operator {
            Operator::Compare(op) => Predicate::Compare {
                path,
                op,
                value: next(),
            },
            Operator::Between => {
                let low = next();
                let high = next();
                Predicate::Between { path, low, high }
            }
            Operator::IsNull => Predicate::Null {
                path,
                negated: false,
            },
            Operator::IsNotNull => Predicate::Null {
                path,
                negated: true,
            },
            Operator::Like(affix, negated) => Predicate::Like {
                path,
                pattern: next(),
                affix,
                negated,
            },
            Operator::In(negated) => Predicate::In {
                path,
                values: next(),
                negated,
            },
            Operator::True => Predicate::eq(path, true),
            Operator::False => Predicate::eq(path, false),
        })
    }

    /// Resolve property words to a path: a root column first, then the relation itself
    /// (meaning its foreign key), then `relation_column` splits.
    fn property(&self, words: &[&str]) -> Result<Path, QueryError> {
        let joined = words.join("_");
        if self.entity.column_kind(&joined).is_some() {
            return Ok(Path::column(joined));
        }
        if let Some(rel) = self.entity.relation(&joined) {
            return Ok(Path::column(rel.column));
        }
        for split in 1..words.len() {
            let rel_name = words[..split].join("_");
            let column = words[split..].join("_");
            if let Some(rel) = self.entity.relation(&rel_name) {
                if rel.columns.contains(&column.as_str()) {
                    return Ok(Path::joined(rel_name, column));
                }
            }
        }
        Err(QueryError::UnknownProperty {
            entity: self.entity.name.to_string(),
            property: joined,
        })
    }

    /// `age_desc_username` → age descending, then username ascending.
    fn order(&self, words: &[&str]) -> Result<Sort, QueryError> {
        if words.is_empty() {
            return Err(self.invalid("nothing follows `order_by`"));
        }
        let mut orders = Vec::new();
        let mut pending: Vec<&str> = Vec::new();
        for w in words {
            let direction = match *w {
                "asc" => Some(Direction::Asc),
                "desc" => Some(Direction::Desc),
                _ => None,
            };
            match direction {
                Some(direction) => {
                    if pending.is_empty() {
                        return Err(self.invalid(format!("`{w}` without a property")));
                    }
                    let path = self.property(&pending)?;
                    orders.push(Order { path, direction });
                    pending.clear();
                }
                None => pending.push(w),
            }
        }
        if !pending.is_empty() {
            let path = self.property(&pending)?;
            orders.push(Order {
                path,
                direction: Direction::Asc,
            });
        }
        Ok(Sort::from_orders(orders))
    }
}

/// Split criteria at the last `order_by`. Criteria starting with `order_by` have no predicate.
fn split_order_by<'w, 'a>(words: &'w [&'a str]) -> (&'w [&'a str], Option<&'w [&'a str]>) {
    let pos = (0..words.len().saturating_sub(1))
        .rev()
        .find(|&i| words[i] == "order" && words[i + 1] == "by");
    match pos {
        Some(i) => (&words[..i], Some(&words[i + 2..])),
        None => (words, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_entities::Member;

    fn parse(method: &str) -> Result<DerivedQuery, QueryError> {
        DerivedQuery::parse::<Member>(method)
    }

    #[test]
    fn username_and_age_greater_than() {
        let q = parse("find_by_username_and_age_greater_than").unwrap();
        assert_eq!(q.subject(), Subject::Find);
        assert_eq!(q.arity(), 2);
        let bound = q.bind(vec!["AAA".into(), 15.into()]).unwrap();
        assert_eq!(
            bound.filter,
            Some(Predicate::And(vec![
                Predicate::eq("username", "AAA"),
                Predicate::compare("age", CompareOp::Gt, 15),
            ]))
        );
    }

    #[test]
    fn descriptive_words_before_by_are_ignored() {
        for m in [
            "find_member_by_username",
            "find_optional_by_username",
            "find_read_only_by_username",
            "read_by_username",
        ] {
            let q = parse(m).unwrap();
            assert_eq!(q.arity(), 1, "{m}");
            assert_eq!(q.filter(), Some(&Predicate::eq("username", Operand::Positional(1))));
        }
    }

    #[test]
    fn nested_property_through_relation() {
        let q = parse("find_by_team_name").unwrap();
        assert_eq!(
            q.filter(),
            Some(&Predicate::eq(Path::joined("team", "name"), Operand::Positional(1)))
        );
        let q = parse("find_by_team").unwrap();
        assert_eq!(q.filter(), Some(&Predicate::eq("team_id", Operand::Positional(1))));
        let q = parse("find_by_team_id").unwrap();
        assert_eq!(q.filter(), Some(&Predicate::eq("team_id", Operand::Positional(1))));
    }

    #[test]
    fn or_groups_and_order_by() {
        let q = parse("find_distinct_by_username_or_age_between_order_by_age_desc_username").unwrap();
        assert!(q.is_distinct());
        assert_eq!(q.arity(), 3);
        assert!(matches!(q.filter(), Some(Predicate::Or(g)) if g.len() == 2));
        assert_eq!(
            q.sort().orders(),
            &[Order::desc("age"), Order::asc("username")]
        );
    }

    #[test]
    fn top_n_with_order_only() {
        let q = parse("find_top3_by_order_by_age_desc").unwrap();
        assert_eq!(q.limit(), Some(3));
        assert!(q.filter().is_none());
        assert_eq!(q.arity(), 0);
        let q = parse("find_first_by_order_by_username").unwrap();
        assert_eq!(q.limit(), Some(1));
        let q = parse("find_first_5_by_age").unwrap();
        assert_eq!(q.limit(), Some(5));
    }

    #[test]
    fn operator_keywords() {
        let cases: &[(&str, usize)] = &[
            ("find_by_age_greater_than_equal", 1),
            ("find_by_age_less_than", 1),
            ("find_by_age_before", 1),
            ("find_by_username_is_null", 0),
            ("find_by_username_not_null", 0),
            ("find_by_username_like", 1),
            ("find_by_username_not_like", 1),
            ("find_by_username_starting_with", 1),
            ("find_by_username_ending_with", 1),
            ("find_by_username_containing", 1),
            ("find_by_username_not_containing", 1),
            ("find_by_username_in", 1),
            ("find_by_username_not_in", 1),
            ("find_by_username_not", 1),
            ("find_by_username_is_not", 1),
            ("find_by_active_true", 0),
            ("find_by_active_is_false", 0),
            ("find_by_username_equals", 1),
            ("find_by_username_is", 1),
        ];
        for (m, arity) in cases {
            let q = parse(m).unwrap_or_else(|e| panic!("{m}: {e}"));
            assert_eq!(q.arity(), *arity, "{m}");
        }
    }

    #[test]
    fn like_affixes_are_applied_on_bind() {
        let q = parse("find_by_username_starting_with").unwrap();
        let bound = q.bind(vec!["mem".into()]).unwrap();
        assert!(matches!(
            bound.filter,
            Some(Predicate::Like { pattern: Operand::Value(ParamValue::String(ref s)), .. }) if s == "mem%"
        ));
    }

    #[test]
    fn subjects() {
        assert_eq!(parse("count_by_age").unwrap().subject(), Subject::Count);
        assert_eq!(parse("exists_by_username").unwrap().subject(), Subject::Exists);
        assert_eq!(parse("delete_by_username").unwrap().subject(), Subject::Delete);
        assert_eq!(parse("remove_by_username").unwrap().subject(), Subject::Delete);
        assert_eq!(parse("exists_by_username").unwrap().bind(vec!["x".into()]).unwrap().limit, Some(1));
        assert_eq!(parse("find_all").unwrap().arity(), 0);
        assert!(parse("count_by_age")
            .unwrap()
            .expect_subject(&[Subject::Find])
            .is_err());
    }

    #[test]
    fn malformed_names_fail() {
        assert!(matches!(
            parse("fetch_by_username"),
            Err(QueryError::InvalidMethodName { .. })
        ));
        assert!(matches!(parse("find_by"), Err(QueryError::InvalidMethodName { .. })));
        assert!(matches!(
            parse("find_by_username_and"),
            Err(QueryError::InvalidMethodName { .. })
        ));
        assert!(matches!(
            parse("find__by_username"),
            Err(QueryError::InvalidMethodName { .. })
        ));
        assert!(matches!(
            parse("findByUsername"),
            Err(QueryError::InvalidMethodName { .. })
        ));
        assert!(matches!(
            parse("count_top3_by_age"),
            Err(QueryError::InvalidMethodName { .. })
        ));
        assert!(matches!(
            parse("find_by_age_order_by"),
            Err(QueryError::InvalidMethodName { .. })
        ));
    }

    #[test]
    fn unknown_property_and_type_mismatch_fail() {
        assert!(matches!(
            parse("find_by_nickname"),
            Err(QueryError::UnknownProperty { ref property, .. }) if property == "nickname"
        ));
        assert!(matches!(
            parse("find_by_team_nickname"),
            Err(QueryError::UnknownProperty { .. })
        ));
        assert!(matches!(
            parse("find_by_age_like"),
            Err(QueryError::IncompatibleOperator { .. })
        ));
        assert!(matches!(
            parse("find_by_active_greater_than"),
            Err(QueryError::IncompatibleOperator { .. })
        ));
        assert!(matches!(
            parse("find_by_username_true"),
            Err(QueryError::IncompatibleOperator { .. })
        ));
    }

    #[test]
    fn bind_checks_arity() {
        let q = parse("find_by_username_and_age_greater_than").unwrap();
        assert_eq!(
            q.bind(vec!["AAA".into()]).unwrap_err(),
            QueryError::Arity {
                expected: 2,
                actual: 1
            }
        );
        assert!(q.expect_arity(2).is_ok());
        assert!(q.expect_arity(3).is_err());
    }
}
