//! Composable query criteria.
//!
//! A [`Specification`] turns a query root into an optional predicate; `None` means
//! "no restriction". Attribute names are checked against entity metadata when the
//! predicate is built, so a misspelled attribute fails the call before any engine work.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::query::{Affix, CompareOp, Operand, Path, Predicate};
use crate::{ColumnKind, EntityMeta, Fetchable, Identifiable, ParamValue, QueryError, RepoResult};

type SpecFn<T> = dyn Fn(&Root<T>) -> RepoResult<Option<Predicate>> + Send + Sync;

pub struct Specification<T> {
    f: Arc<SpecFn<T>>,
}

impl<T> Clone for Specification<T> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<T> fmt::Debug for Specification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification").finish_non_exhaustive()
    }
}

impl<T: 'static> Specification<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Root<T>) -> RepoResult<Option<Predicate>> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Matches every row.
    pub fn all() -> Self {
        Self::new(|_| Ok(None))
    }

    /// `None` matches every row.
    pub fn where_(spec: Option<Specification<T>>) -> Self {
        spec.unwrap_or_else(Self::all)
    }

    /// Both sides are evaluated; an unrestricted side contributes nothing.
    pub fn and(self, other: Specification<T>) -> Self {
        Self::new(move |root| {
            let left = (self.f)(root)?;
            let right = (other.f)(root)?;
            Ok(match (left, right) {
                (Some(l), Some(r)) => Some(l.and(r)),
                (l, r) => l.or(r),
            })
        })
    }

    /// Both sides are evaluated; an unrestricted side contributes nothing.
    pub fn or(self, other: Specification<T>) -> Self {
        Self::new(move |root| {
            let left = (self.f)(root)?;
            let right = (other.f)(root)?;
            Ok(match (left, right) {
                (Some(l), Some(r)) => Some(l.or(r)),
                (l, r) => l.or(r),
            })
        })
    }

    /// Negation. Negating an unrestricted specification leaves it unrestricted.
    #[allow(clippy::should_implement_trait)]
    pub fn not(spec: Specification<T>) -> Self {
        Self::new(move |root| Ok((spec.f)(root)?.map(Predicate::not)))
    }

    pub fn all_of(specs: impl IntoIterator<Item = Specification<T>>) -> Self {
        specs.into_iter().fold(Self::all(), Self::and)
    }

    pub fn any_of(specs: impl IntoIterator<Item = Specification<T>>) -> Self {
        let mut iter = specs.into_iter();
        match iter.next() {
            Some(first) => iter.fold(first, Self::or),
            None => Self::all(),
        }
    }
}

impl<T: Fetchable + Identifiable + 'static> Specification<T> {
    pub fn to_predicate(&self) -> RepoResult<Option<Predicate>> {
        (self.f)(&Root::new())
    }
}

/// Attribute accessor for the queried entity.
pub struct Root<T> {
    meta: EntityMeta,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Fetchable + Identifiable> Root<T> {
    pub fn new() -> Self {
        Self {
            meta: EntityMeta::of::<T>(),
            _entity: PhantomData,
        }
    }
}

impl<T: Fetchable + Identifiable> Default for Root<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Root<T> {
    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    /// A root attribute. Naming a relation yields its foreign key column.
    pub fn get(&self, attribute: &str) -> RepoResult<Attribute> {
        let path = match self.meta.relation(attribute) {
            Some(rel) => Path::column(rel.column),
            None => Path::column(attribute),
        };
        let kind = self.meta.resolve(&path)?;
        Ok(Attribute { path, kind })
    }

    /// Inner-join a many-to-one relation.
    pub fn join(&self, relation: &str) -> RepoResult<JoinRoot<'_>> {
        if self.meta.relation(relation).is_none() {
            return Err(QueryError::UnknownRelation {
                entity: self.meta.name.to_string(),
                relation: relation.to_string(),
            }
            .into());
        }
        Ok(JoinRoot {
            meta: &self.meta,
            relation: relation.to_string(),
        })
    }
}

pub struct JoinRoot<'a> {
    meta: &'a EntityMeta,
    relation: String,
}

impl JoinRoot<'_> {
    pub fn get(&self, attribute: &str) -> RepoResult<Attribute> {
        let path = Path::joined(self.relation.clone(), attribute);
        let kind = self.meta.resolve(&path)?;
        Ok(Attribute { path, kind })
    }
}

/// A resolved attribute with predicate builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    path: Path,
    kind: ColumnKind,
}

impl Attribute {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    fn compare(&self, op: CompareOp, value: impl Into<ParamValue>) -> Predicate {
        Predicate::compare(self.path.clone(), op, Operand::Value(value.into()))
    }

    pub fn eq(&self, value: impl Into<ParamValue>) -> Predicate {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(&self, value: impl Into<ParamValue>) -> Predicate {
        self.compare(CompareOp::Ne, value)
    }

    pub fn gt(&self, value: impl Into<ParamValue>) -> Predicate {
        self.compare(CompareOp::Gt, value)
    }

    pub fn ge(&self, value: impl Into<ParamValue>) -> Predicate {
        self.compare(CompareOp::Ge, value)
    }

    pub fn lt(&self, value: impl Into<ParamValue>) -> Predicate {
        self.compare(CompareOp::Lt, value)
    }

    pub fn le(&self, value: impl Into<ParamValue>) -> Predicate {
        self.compare(CompareOp::Le, value)
    }

    pub fn between(&self, low: impl Into<ParamValue>, high: impl Into<ParamValue>) -> Predicate {
        Predicate::Between {
            path: self.path.clone(),
            low: Operand::Value(low.into()),
            high: Operand::Value(high.into()),
        }
    }

    /// `pattern` uses `%` and `_` wildcards.
    pub fn like(&self, pattern: impl Into<ParamValue>) -> Predicate {
        Predicate::Like {
            path: self.path.clone(),
            pattern: Operand::Value(pattern.into()),
            affix: Affix::Exact,
            negated: false,
        }
    }

    pub fn in_<V: Into<ParamValue>>(&self, values: Vec<V>) -> Predicate {
        Predicate::In {
            path: self.path.clone(),
            values: Operand::Value(ParamValue::from(values)),
            negated: false,
        }
    }

    pub fn is_null(&self) -> Predicate {
        Predicate::Null {
            path: self.path.clone(),
            negated: false,
        }
    }

    pub fn is_not_null(&self) -> Predicate {
        Predicate::Null {
            path: self.path.clone(),
            negated: true,
        }
    }

    pub fn is_true(&self) -> Predicate {
        self.eq(true)
    }

    pub fn is_false(&self) -> Predicate {
        self.eq(false)
    }
}
