//! Predicate evaluation over joined rows, with SQL three-valued logic.

use std::cmp::Ordering;

use datarepo_core::paging::{Direction, Sort};
use datarepo_core::query::{Affix, CompareOp, Operand, Path, Predicate, LIKE_ESCAPE};
use datarepo_core::{ParamValue, QueryError, Record, RepoResult};

/// A root row plus the related rows of its joins (`None` for an unmatched left join).
pub(crate) struct Joined<'a> {
    pub root: &'a Record,
    pub related: Vec<(&'a str, Option<&'a Record>)>,
}

impl Joined<'_> {
    pub fn value(&self, path: &Path) -> ParamValue {
        let source = match &path.relation {
            None => Some(self.root),
            Some(rel) => self
                .related
                .iter()
                .find(|(name, _)| name == rel)
                .and_then(|(_, row)| *row),
        };
        source
            .and_then(|r| r.get(&path.column))
            .cloned()
            .unwrap_or(ParamValue::Null)
    }
}

fn operand(o: &Operand) -> Result<&ParamValue, QueryError> {
    match o {
        Operand::Value(v) => Ok(v),
        Operand::Positional(i) => Err(QueryError::MissingParameter(format!("?{i}"))),
        Operand::Named(n) => Err(QueryError::MissingParameter(n.clone())),
    }
}

/// `Some(true)` keeps the row; `None` is SQL's unknown.
pub(crate) fn eval(p: &Predicate, row: &Joined<'_>) -> RepoResult<Option<bool>> {
    Ok(match p {
        Predicate::Compare { path, op, value } => {
            let left = row.value(path);
            left.compare(operand(value)?).map(|ord| match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
            })
        }
        Predicate::Between { path, low, high } => {
            let v = row.value(path);
            let above = v.compare(operand(low)?).map(|o| o != Ordering::Less);
            let below = v.compare(operand(high)?).map(|o| o != Ordering::Greater);
            and3([above, below])
        }
        Predicate::In {
            path,
            values,
            negated,
        } => {
            let v = row.value(path);
            let items = match operand(values)? {
                ParamValue::List(items) => items.as_slice(),
                single => std::slice::from_ref(single),
            };
            let found = if items.is_empty() {
                Some(false)
            } else if v.is_null() {
                None
            } else {
                or3(items.iter().map(|i| v.compare(i).map(|o| o == Ordering::Equal)))
            };
            found.map(|f| f != *negated)
        }
        Predicate::Null { path, negated } => Some(row.value(path).is_null() != *negated),
        Predicate::Like {
            path,
            pattern,
            affix,
            negated,
        } => {
            let v = row.value(path);
            match (v.as_str(), operand(pattern)?) {
                (Some(s), ParamValue::String(pat)) => {
                    let pat = if *affix == Affix::Exact {
                        pat.clone()
                    } else {
                        affix.apply(pat)
                    };
                    Some(like(s, &pat) != *negated)
                }
                _ => None,
            }
        }
        Predicate::And(parts) => and3(
            parts
                .iter()
                .map(|p| eval(p, row))
                .collect::<RepoResult<Vec<_>>>()?,
        ),
        Predicate::Or(parts) => or3(
            parts
                .iter()
                .map(|p| eval(p, row))
                .collect::<RepoResult<Vec<_>>>()?,
        ),
        Predicate::Not(inner) => eval(inner, row)?.map(|b| !b),
    })
}

fn and3(values: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for v in values {
        match v {
            Some(false) => return Some(false),
            None => unknown = true,
            Some(true) => {}
        }
    }
    (!unknown).then_some(true)
}

fn or3(values: impl IntoIterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for v in values {
        match v {
            Some(true) => return Some(true),
            None => unknown = true,
            Some(false) => {}
        }
    }
    (!unknown).then_some(false)
}

enum Token {
    AnyRun,
    AnyOne,
    Literal(char),
}

/// SQL `LIKE ... ESCAPE '\\'`: `%` matches any run, `_` one character, and the escape
/// character makes the next one literal; ASCII case-insensitive.
pub(crate) fn like(value: &str, pattern: &str) -> bool {
    let v: Vec<char> = value.chars().map(|c| c.to_ascii_lowercase()).collect();
    let mut tokens = Vec::new();
    let mut chars = pattern.chars().map(|c| c.to_ascii_lowercase());
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::AnyRun,
            '_' => Token::AnyOne,
            c if c == LIKE_ESCAPE => Token::Literal(chars.next().unwrap_or(LIKE_ESCAPE)),
            c => Token::Literal(c),
        });
    }
    // dp[j]: pattern[..i] matches value[..j]
    let mut dp = vec![false; v.len() + 1];
    dp[0] = true;
    for token in &tokens {
        let mut next = vec![false; v.len() + 1];
        match token {
            Token::AnyRun => {
                let mut any = false;
                for j in 0..=v.len() {
                    any |= dp[j];
                    next[j] = any;
                }
            }
            Token::AnyOne => {
                for j in 1..=v.len() {
                    next[j] = dp[j - 1];
                }
            }
            Token::Literal(c) => {
                for j in 1..=v.len() {
                    next[j] = dp[j - 1] && *c == v[j - 1];
                }
            }
        }
        dp = next;
    }
    dp[v.len()]
}

/// Order two rows by `sort`. Nulls sort first ascending and last descending.
pub(crate) fn compare_rows(sort: &Sort, a: &Joined<'_>, b: &Joined<'_>) -> Ordering {
    for order in sort.orders() {
        let (x, y) = (a.value(&order.path), b.value(&order.path));
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => x.compare(&y).unwrap_or(Ordering::Equal),
        };
        let ord = match order.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
