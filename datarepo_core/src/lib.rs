#![forbid(unsafe_code)]
//! Core traits for the datarepo repository library.
//! This crate is engine-agnostic: it defines the entity metadata traits, the query model,
//! the parsers for derived and textual queries, and the unit of work (`Session`).
//! Concrete persistence engines implement [`engine::Engine`].

// Re-export for downstream macro expansions (used by datarepo_macros::repository)
pub use async_trait::async_trait;

pub mod config;
pub mod derived;
pub mod engine;
pub mod hints;
pub mod paging;
pub mod projection;
pub mod ql;
pub mod query;
mod record;
mod reference;
pub mod session;
pub mod specification;
pub mod transactions;
mod value;

pub use record::Record;
pub use reference::Ref;
pub use value::{ConversionError, EntityKey, FromParamValue, ParamValue};

use engine::Engine;
use paging::{Page, PageRequest, Sort};
use session::Session;
use specification::Specification;

/// Marker trait for types that can be fetched from a database.
/// Implemented via `#[derive(Entity)]` proc-macro in `datarepo_macros`.
///
/// Provides compile-time metadata used by repository generators and query parsers.
pub trait Fetchable {
    /// Entity name as used in query text (`from Member m`).
    const ENTITY_NAME: &'static str;
    const TABLE: &'static str;
    const SELECT_COLUMNS: &'static [&'static str];

    /// A list of (column_name, rust_type) tuples for the non-key columns. Derived queries
    /// use the type to reject operators that cannot apply (e.g. `like` on an integer).
    const FINDABLE_COLUMNS: &'static [(&'static str, &'static str)];

    /// Many-to-one relations owned by this entity.
    const RELATIONS: &'static [Relation] = &[];
}

/// Metadata for a many-to-one relation stored as a foreign key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// Attribute name used in paths (`team` in `team.name`).
    pub name: &'static str,
    /// Foreign key column on the owning table.
    pub column: &'static str,
    pub entity: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub columns: &'static [&'static str],
    pub findable: &'static [(&'static str, &'static str)],
}

/// Coarse value kind of a column, derived from the Rust field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Bool,
    /// Primary key or foreign key column.
    Key,
    Other,
}

impl ColumnKind {
    /// Classify a stringified Rust type such as `Option<String>` or `Ref<Team>`.
    pub fn from_type_name(ty: &str) -> Self {
        let ty = ty.trim();
        if let Some(inner) = ty.strip_prefix("Option<").and_then(|s| s.strip_suffix('>')) {
            return Self::from_type_name(inner);
        }
        if ty.starts_with("Ref<") {
            return ColumnKind::Key;
        }
        match ty {
            "String" | "&str" => ColumnKind::Text,
            "i8" | "i16" | "i32" | "i64" | "u8" | "u16" | "u32" | "u64" | "isize" | "usize" => {
                ColumnKind::Integer
            }
            "f32" | "f64" => ColumnKind::Float,
            "bool" => ColumnKind::Bool,
            _ => ColumnKind::Other,
        }
    }

    pub fn is_orderable(self) -> bool {
        !matches!(self, ColumnKind::Bool)
    }
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Bool => "boolean",
            ColumnKind::Key => "key",
            ColumnKind::Other => "value",
        };
        f.write_str(s)
    }
}

/// Runtime view of an entity's metadata, built from the `Fetchable`/`Identifiable` constants.
/// Queries carry this so engines never need the entity type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub columns: &'static [&'static str],
    pub findable: &'static [(&'static str, &'static str)],
    pub relations: &'static [Relation],
}

impl EntityMeta {
    pub fn of<T: Fetchable + Identifiable>() -> Self {
        Self {
            name: T::ENTITY_NAME,
            table: T::TABLE,
            id_column: T::ID_COLUMN,
            columns: T::SELECT_COLUMNS,
            findable: T::FINDABLE_COLUMNS,
            relations: T::RELATIONS,
        }
    }

    pub fn relation(&self, name: &str) -> Option<&'static Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    /// Kind of a root column, `None` when the column does not exist.
    pub fn column_kind(&self, column: &str) -> Option<ColumnKind> {
        if column == self.id_column {
            return Some(ColumnKind::Key);
        }
        self.findable
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, ty)| ColumnKind::from_type_name(ty))
            .or_else(|| self.has_column(column).then_some(ColumnKind::Other))
    }

    /// Resolve an attribute path against this entity, returning the kind of the target column.
    pub fn resolve(&self, path: &query::Path) -> Result<ColumnKind, QueryError> {
        match &path.relation {
            None => self
                .column_kind(&path.column)
                .ok_or_else(|| QueryError::UnknownProperty {
                    entity: self.name.to_string(),
                    property: path.column.clone(),
                }),
            Some(rel_name) => {
                let rel = self
                    .relation(rel_name)
                    .ok_or_else(|| QueryError::UnknownRelation {
                        entity: self.name.to_string(),
                        relation: rel_name.clone(),
                    })?;
                if path.column == rel.id_column {
                    return Ok(ColumnKind::Key);
                }
                rel.findable
                    .iter()
                    .find(|(c, _)| *c == path.column)
                    .map(|(_, ty)| ColumnKind::from_type_name(ty))
                    .or_else(|| rel.columns.contains(&path.column.as_str()).then_some(ColumnKind::Other))
                    .ok_or_else(|| QueryError::UnknownProperty {
                        entity: rel.entity.to_string(),
                        property: path.column.clone(),
                    })
            }
        }
    }
}

/// Trait for entities that have an identifiable key.
/// This trait exposes the key type and column name so macros can introspect it.
pub trait Identifiable {
    /// The type of the primary key (e.g., `i64`).
    type Key;

    /// The name of the primary key column in the database.
    const ID_COLUMN: &'static str;

    /// Returns a copy of the entity's ID, if it has one.
    fn id(&self) -> Option<Self::Key>;

    /// The same entity carrying `id`; used once a key has been generated on insert.
    fn with_id(self, id: Self::Key) -> Self;
}

/// Trait for types whose fields can be extracted for an INSERT statement.
/// This is implemented by the `#[derive(Entity)]` macro.
pub trait Insertable {
    /// The columns to be used in an INSERT statement, excluding auto-generated keys.
    const INSERT_COLUMNS: &'static [&'static str];

    /// The values of the fields corresponding to `INSERT_COLUMNS`.
    fn insert_values(&self) -> Vec<ParamValue>;
}

/// Trait for types whose fields can be extracted for an UPDATE statement.
/// This is implemented by the `#[derive(Entity)]` macro.
pub trait Updatable {
    /// The columns to be used in an UPDATE statement's SET clause.
    const UPDATE_COLUMNS: &'static [&'static str];

    /// The values of the fields corresponding to `UPDATE_COLUMNS`.
    fn update_values(&self) -> Vec<ParamValue>;
}

/// Failures detected while parsing or validating a query, before any engine work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("cannot derive a query from method `{method}`: {reason}")]
    InvalidMethodName { method: String, reason: String },
    #[error("no property `{property}` on entity `{entity}`")]
    UnknownProperty { entity: String, property: String },
    #[error("no relation `{relation}` on entity `{entity}`")]
    UnknownRelation { entity: String, relation: String },
    #[error("operator `{operator}` cannot be applied to `{property}` ({kind})")]
    IncompatibleOperator {
        property: String,
        operator: String,
        kind: String,
    },
    #[error("syntax error at offset {offset} in `{query}`: {message}")]
    Syntax {
        query: String,
        offset: usize,
        message: String,
    },
    #[error("query targets entity `{found}` but the repository manages `{expected}`")]
    EntityMismatch { expected: String, found: String },
    #[error("unknown alias `{0}`")]
    UnknownAlias(String),
    #[error("unsupported query construct: {0}")]
    Unsupported(String),
    #[error("expected {expected} argument(s), got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("missing value for parameter `{0}`")]
    MissingParameter(String),
    #[error("`{query}` produces {found}, but the method expects {expected}")]
    ResultShape {
        query: String,
        expected: String,
        found: String,
    },
}

/// Lightweight, engine-agnostic error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The entity was not found.
    #[error("entity not found")]
    NotFound,
    /// A single-result query matched more than one row.
    #[error("expected at most {expected} result(s) but found {actual}")]
    NonUniqueResult { expected: usize, actual: usize },
    /// Invalid derived query, query text, specification or parameter binding.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A row lock is held by another connection.
    #[error("row {table}#{key} is locked by another transaction")]
    LockUnavailable { table: String, key: String },
    /// The operation needs an active transaction (e.g. pessimistic locking).
    #[error("{operation} requires an active transaction")]
    TransactionRequired { operation: &'static str },
    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),
    #[error("invalid configuration")]
    Config {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Error while mapping a backend row into an entity.
    #[error("mapping error")]
    Mapping {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Opaque backend error from the underlying driver or adapter.
    #[error("backend error")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An engine failure tagged with the repository operation that issued it.
    #[error("{operation} failed: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: Box<RepoError>,
    },
}

impl RepoError {
    /// Wrap a backend/driver error.
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RepoError::Backend {
            source: Box::new(e),
        }
    }
    /// Wrap a row-mapping error.
    pub fn mapping<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RepoError::Mapping {
            source: Box::new(e),
        }
    }
    /// Wrap a configuration parsing error.
    pub fn config<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RepoError::Config {
            source: Box::new(e),
        }
    }

    /// Tag an engine error with the operation that issued it. Query errors stay untagged.
    pub fn during(self, operation: &'static str) -> Self {
        match self {
            e @ (RepoError::Query(_) | RepoError::Operation { .. }) => e,
            e => RepoError::Operation {
                operation,
                source: Box::new(e),
            },
        }
    }

    /// The innermost error behind any operation tags.
    pub fn root_cause(&self) -> &RepoError {
        match self {
            RepoError::Operation { source, .. } => source.root_cause(),
            e => e,
        }
    }

    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self.root_cause(), RepoError::LockUnavailable { .. })
    }
}

/// Convenience alias for results returned by repository methods.
pub type RepoResult<T> = Result<T, RepoError>;

/// A tiny adapter for mapping a backend-specific row type into an entity `T`.
/// `#[derive(Entity)]` generates one for [`Record`] rows, which every engine produces.
#[allow(clippy::wrong_self_convention)]
pub trait RowAdapter<T> {
    type Row;
    fn from_row(&self, row: &Self::Row) -> RepoResult<T>;
}

/// The generic repository contract for an entity `T` managed through engine `E`.
///
/// Every operation takes the unit of work explicitly. Writes go through the session's
/// persistence context; removals are queued until the session flushes.
#[async_trait]
pub trait Repository<T, E>: Send + Sync
where
    T: Identifiable + Send + Sync + 'static,
    T::Key: Send + Sync,
    E: Engine,
{
    /// Insert when the entity has no key, otherwise merge it into the stored row.
    /// Returns the managed instance with its key populated.
    async fn save(&self, session: &mut Session<E>, entity: T) -> RepoResult<T>;

    async fn save_all(&self, session: &mut Session<E>, entities: Vec<T>) -> RepoResult<Vec<T>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            out.push(self.save(session, e).await?);
        }
        Ok(out)
    }

    /// Fetch an entity by its primary key. Returns Ok(None) if not found.
    async fn find_by_id(&self, session: &mut Session<E>, id: &T::Key) -> RepoResult<Option<T>>;

    async fn exists_by_id(&self, session: &mut Session<E>, id: &T::Key) -> RepoResult<bool> {
        Ok(self.find_by_id(session, id).await?.is_some())
    }

    async fn find_all(&self, session: &mut Session<E>) -> RepoResult<Vec<T>>;

    async fn find_all_sorted(&self, session: &mut Session<E>, sort: &Sort) -> RepoResult<Vec<T>>;

    async fn find_all_by_id(&self, session: &mut Session<E>, ids: &[T::Key])
        -> RepoResult<Vec<T>>;

    /// A generic equality finder for a single column.
    async fn find_by_field(
        &self,
        session: &mut Session<E>,
        field_name: &str,
        value: ParamValue,
    ) -> RepoResult<Vec<T>>;

    async fn find_page(&self, session: &mut Session<E>, request: &PageRequest)
        -> RepoResult<Page<T>>;

    async fn count(&self, session: &mut Session<E>) -> RepoResult<u64>;

    /// Queue the removal of `entity`; the row disappears when the session flushes.
    async fn delete(&self, session: &mut Session<E>, entity: &T) -> RepoResult<()>;

    async fn delete_by_id(&self, session: &mut Session<E>, id: &T::Key) -> RepoResult<()>;

    async fn delete_all(&self, session: &mut Session<E>) -> RepoResult<()>;
}

/// Specification-based queries, combinable with paging.
#[async_trait]
pub trait SpecificationExecutor<T, E>: Send + Sync
where
    T: Identifiable + Send + Sync + 'static,
    E: Engine,
{
    async fn find_all_spec(&self, session: &mut Session<E>, spec: &Specification<T>)
        -> RepoResult<Vec<T>>;

    /// `None` for no match, `RepoError::NonUniqueResult` for more than one.
    async fn find_one_spec(&self, session: &mut Session<E>, spec: &Specification<T>)
        -> RepoResult<Option<T>>;

    async fn find_page_spec(
        &self,
        session: &mut Session<E>,
        spec: &Specification<T>,
        request: &PageRequest,
    ) -> RepoResult<Page<T>>;

    async fn count_spec(&self, session: &mut Session<E>, spec: &Specification<T>)
        -> RepoResult<u64>;

    async fn exists_spec(&self, session: &mut Session<E>, spec: &Specification<T>)
        -> RepoResult<bool> {
        Ok(self.count_spec(session, spec).await? > 0)
    }
}


#[cfg(test)]
mod tests {
    use super::test_entities::*;
    use super::*;

    #[test]
    fn repo_error_display_messages() {
        let e1 = RepoError::NotFound;
        assert_eq!(format!("{}", e1), "entity not found");

        let e2 = RepoError::mapping(std::io::Error::new(std::io::ErrorKind::Other, "bad row"));
        // Display should start with the variant message; source included by Debug chain.
        assert_eq!(format!("{}", e2), "mapping error");

        let e3 = RepoError::backend(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(format!("{}", e3), "backend error");
    }

    #[test]
    fn operation_tag_wraps_engine_errors_and_unwraps_to_root() {
        let err = RepoError::LockUnavailable {
            table: "members".into(),
            key: "1".into(),
        }
        .during("find_by_username");
        assert_eq!(
            err.to_string(),
            "find_by_username failed: row members#1 is locked by another transaction"
        );
        assert!(err.is_lock_unavailable());
        // Tagging twice keeps the innermost operation name.
        let again = err.during("outer");
        assert!(matches!(
            again,
            RepoError::Operation {
                operation: "find_by_username",
                ..
            }
        ));
    }

    #[test]
    fn query_errors_are_not_tagged() {
        let err = RepoError::from(QueryError::MissingParameter("age".into())).during("find");
        assert!(matches!(err, RepoError::Query(QueryError::MissingParameter(_))));
    }

    #[test]
    fn column_kinds_from_type_names() {
        assert_eq!(ColumnKind::from_type_name("String"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_type_name("Option<i32>"), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_type_name("Ref<Team>"), ColumnKind::Key);
        assert_eq!(ColumnKind::from_type_name("bool"), ColumnKind::Bool);
        assert_eq!(ColumnKind::from_type_name("f64"), ColumnKind::Float);
        assert_eq!(ColumnKind::from_type_name("Uuid"), ColumnKind::Other);
    }

    #[test]
    fn entity_meta_resolves_root_and_joined_paths() {
        let meta = member_meta();
        assert_eq!(meta.table, "members");
        assert_eq!(
            meta.resolve(&query::Path::column("age")).unwrap(),
            ColumnKind::Integer
        );
        assert_eq!(
            meta.resolve(&query::Path::joined("team", "name")).unwrap(),
            ColumnKind::Text
        );
        assert_eq!(
            meta.resolve(&query::Path::joined("team", "id")).unwrap(),
            ColumnKind::Key
        );
        let err = meta.resolve(&query::Path::column("nickname")).unwrap_err();
        assert!(matches!(err, QueryError::UnknownProperty { .. }));
        let err = meta.resolve(&query::Path::joined("club", "name")).unwrap_err();
        assert!(matches!(err, QueryError::UnknownRelation { .. }));
    }
}
