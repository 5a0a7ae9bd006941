//! Per-query hints and bulk statement options.

use crate::query::{LockMode, SelectQuery};
use crate::{EntityMeta, QueryError};

/// Hints attached to a query method. They change how results are loaded, never which
/// rows are returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryHints {
    /// Results are neither served from nor registered in the persistence context.
    pub read_only: bool,
    pub lock: LockMode,
    /// Relations joined eagerly so `Ref` fields arrive loaded.
    pub fetch: Vec<String>,
}

impl QueryHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    pub fn fetch(mut self, relation: impl Into<String>) -> Self {
        let relation = relation.into();
        if !self.fetch.contains(&relation) {
            self.fetch.push(relation);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == QueryHints::default()
    }

    /// Every fetched relation must exist on the entity.
    pub fn validate(&self, meta: &EntityMeta) -> Result<(), QueryError> {
        for rel in &self.fetch {
            if meta.relation(rel).is_none() {
                return Err(QueryError::UnknownRelation {
                    entity: meta.name.to_string(),
                    relation: rel.clone(),
                });
            }
        }
        Ok(())
    }

    /// Apply fetch joins and the lock mode to a query.
    pub fn apply(&self, mut query: SelectQuery) -> SelectQuery {
        for rel in &self.fetch {
            query = query.fetch(rel.clone());
        }
        if self.lock != LockMode::None {
            query = query.lock(self.lock);
        }
        query
    }
}

/// Persistence-context handling around a bulk statement.
///
/// Bulk statements write straight to the engine; instances already loaded in the
/// session keep their old values unless `clear_after` is set or the caller clears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Flush pending writes before the statement runs.
    pub flush_before: bool,
    /// Clear the persistence context after the statement ran.
    pub clear_after: bool,
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_before(mut self) -> Self {
        self.flush_before = true;
        self
    }

    pub fn clear_after(mut self) -> Self {
        self.clear_after = true;
        self
    }
}
