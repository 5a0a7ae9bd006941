use std::fmt;

use crate::engine::Engine;
use crate::session::Session;
use crate::{FromParamValue, Identifiable, ParamValue, Record, RepoResult, Repository, RowAdapter};

/// A many-to-one reference: absent, known only by key, or loaded.
///
/// Rows fetched without a join carry the key; rows fetched with a fetch join (or a
/// reference resolved through [`Ref::load`]) carry the related entity.
pub enum Ref<T: Identifiable> {
    Null,
    Key(T::Key),
    Loaded(Box<T>),
}

impl<T: Identifiable> Ref<T> {
    /// Reference an already-persisted entity. Entities without a key produce `Null`.
    pub fn to(entity: &T) -> Self
    where
        T: Clone,
    {
        if entity.id().is_some() {
            Ref::Loaded(Box::new(entity.clone()))
        } else {
            Ref::Null
        }
    }

    pub fn key(&self) -> Option<T::Key>
    where
        T::Key: Clone,
    {
        match self {
            Ref::Null => None,
            Ref::Key(k) => Some(k.clone()),
            Ref::Loaded(e) => e.id(),
        }
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Ref::Loaded(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Ref::Null)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Ref::Loaded(_))
    }

    /// The foreign key value written for this reference.
    pub fn to_param(&self) -> ParamValue
    where
        T::Key: Clone + Into<ParamValue>,
    {
        self.key().map(Into::into).unwrap_or(ParamValue::Null)
    }

    /// Build a reference from a row: the related entity when the row carries the
    /// relation's columns under `relation.`, otherwise the foreign key in `column`.
    pub fn from_parts<A>(row: &Record, column: &str, relation: &str, adapter: &A) -> RepoResult<Self>
    where
        A: RowAdapter<T, Row = Record>,
        T::Key: FromParamValue,
    {
        let joined = row.scoped(relation);
        if !joined.is_empty() && !joined.is_all_null() {
            return Ok(Ref::Loaded(Box::new(adapter.from_row(&joined)?)));
        }
        Ok(match row.try_get::<Option<T::Key>>(column)? {
            Some(k) => Ref::Key(k),
            None => Ref::Null,
        })
    }

    /// Resolve a key-only reference through `repo`, replacing it with the loaded entity.
    /// A key whose row no longer exists resolves to `None` and leaves the reference as is.
    pub async fn load<E, R>(&mut self, repo: &R, session: &mut Session<E>) -> RepoResult<Option<&T>>
    where
        E: Engine,
        R: Repository<T, E>,
        T: Send + Sync + 'static,
        T::Key: Send + Sync,
    {
        if let Ref::Key(k) = self {
            if let Some(entity) = repo.find_by_id(session, k).await? {
                *self = Ref::Loaded(Box::new(entity));
            }
        }
        Ok(self.get())
    }
}

impl<T: Identifiable> Default for Ref<T> {
    fn default() -> Self {
        Ref::Null
    }
}

impl<T> Clone for Ref<T>
where
    T: Identifiable + Clone,
    T::Key: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Ref::Null => Ref::Null,
            Ref::Key(k) => Ref::Key(k.clone()),
            Ref::Loaded(e) => Ref::Loaded(e.clone()),
        }
    }
}

impl<T> fmt::Debug for Ref<T>
where
    T: Identifiable + fmt::Debug,
    T::Key: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Null => f.write_str("Ref::Null"),
            Ref::Key(k) => f.debug_tuple("Ref::Key").field(k).finish(),
            Ref::Loaded(e) => f.debug_tuple("Ref::Loaded").field(e).finish(),
        }
    }
}

/// References are equal when they point at the same key, loaded or not.
impl<T> PartialEq for Ref<T>
where
    T: Identifiable,
    T::Key: Clone + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T: Identifiable> From<Option<T::Key>> for Ref<T> {
    fn from(key: Option<T::Key>) -> Self {
        match key {
            Some(k) => Ref::Key(k),
            None => Ref::Null,
        }
    }
}
