#![forbid(unsafe_code)]
//! Facade crate re-exporting core traits and macros for the `datarepo` library.
//!
//! This crate provides the main public API. It re-exports the core traits, the query
//! model, the unit of work and the procedural macros, and hosts [`SimpleRepository`],
//! the implementation every `#[repository]` delegates to.
//!
//! # Example: Deriving `Entity`
//!
//! ```ignore
//! use datarepo::{Entity, Fetchable, Ref};
//!
//! #[derive(Entity, Clone, Debug)]
//! pub struct Team {
//!     #[fetch(id)]
//!     pub id: Option<i64>,
//!     pub name: String,
//! }
//!
//! #[derive(Entity, Clone, Debug)]
//! pub struct Member {
//!     #[fetch(id)]
//!     pub id: Option<i64>,
//!     pub username: String,
//!     pub age: i32,
//!     // Stored as `team_id`; reachable in queries as `team.name`.
//!     pub team: Ref<Team>,
//! }
//!
//! assert_eq!(Member::TABLE, "members");
//! assert_eq!(Member::SELECT_COLUMNS, &["id", "username", "age", "team_id"]);
//! let _adapter = MemberRowAdapter;
//! ```
//!
//! # Example: Generating a Repository
//!
//! ```ignore
//! #[datarepo::repository(
//!     entity = Member,
//!     finders(
//!         find_by_username_and_age_greater_than(username: String, age: i32) -> Vec,
//!         count_by_age(age: i32) -> Count,
//!     ),
//!     queries(
//!         find_user(username: String, age: i32) -> Vec =
//!             "select m from Member m where m.username = :username and m.age = :age",
//!     )
//! )]
//! pub mod member_repository {}
//!
//! let repo = member_repository::Repository::new()?;
//! let mut session = Session::open(&engine).await?;
//! let found = repo.find_by_username_and_age_greater_than(&mut session, "AAA".into(), 15).await?;
//! ```
//! Method names and query texts are parsed when `new()` runs; a typo fails there.

mod simple;

pub use simple::SimpleRepository;

// Re-export all core traits.
pub use datarepo_core::{
    EntityKey, EntityMeta, Fetchable, FromParamValue, Identifiable, Insertable, ParamValue,
    QueryError, Record, Ref, Relation, RepoError, RepoResult, Repository, RowAdapter,
    SpecificationExecutor, Updatable,
};

// Re-export all procedural macros.
pub use datarepo_macros::{repository, Entity, Projection};

pub use datarepo_core::{
    config, derived, engine, hints, paging, projection, ql, query, session, specification,
    transactions,
};

pub use datarepo_core::engine::Engine;
pub use datarepo_core::hints::{BulkOptions, QueryHints};
pub use datarepo_core::paging::{Direction, Order, Page, PageRequest, Slice, Sort};
pub use datarepo_core::projection::FromRecord;
pub use datarepo_core::query::{LockMode, Params, Predicate};
pub use datarepo_core::session::Session;
pub use datarepo_core::specification::{Root, Specification};
pub use datarepo_core::transactions::{
    Isolation, Propagation, TransactionDefinition, TransactionTemplate,
};

// Optional re-export of the SQL builder helpers.
#[cfg(feature = "sql-builder")]
pub use datarepo_sql_builder as sql_builder;

/// A hand-written repository extension composed into a generated repository with
/// `#[repository(custom = Type, ..)]`.
///
/// `build` runs once inside the generated `new()`, so query texts parsed there fail
/// repository construction the same way generated finders do.
pub trait RepositoryFragment: Sized + Clone + Send + Sync {
    fn build() -> RepoResult<Self>;
}

// Optional streaming extension: wraps find_all() into a Stream.
#[cfg(feature = "stream-ext")]
pub mod stream_ext {
    use crate::{Engine, Identifiable, RepoResult, Repository, Session};
    use futures_core::Stream;
    use std::pin::Pin;

    pub trait FindStreamExt<T, E>: Repository<T, E>
    where
        T: Identifiable + Send + Sync + 'static,
        T::Key: Send + Sync,
        E: Engine,
    {
        /// Yields the results of `find_all` one by one. Rows are fetched up front; the
        /// stream only changes the shape of the result.
        fn find_all_stream<'a>(
            &'a self,
            session: &'a mut Session<E>,
        ) -> Pin<Box<dyn Stream<Item = RepoResult<T>> + Send + 'a>>;
    }

    impl<T, E, R> FindStreamExt<T, E> for R
    where
        T: Identifiable + Send + Sync + 'static,
        T::Key: Send + Sync,
        E: Engine,
        R: Repository<T, E> + Send + Sync,
    {
        fn find_all_stream<'a>(
            &'a self,
            session: &'a mut Session<E>,
        ) -> Pin<Box<dyn Stream<Item = RepoResult<T>> + Send + 'a>> {
            Box::pin(async_stream::try_stream! {
                let items = self.find_all(session).await?;
                for item in items {
                    yield item;
                }
            })
        }
    }
}

// Engines re-exported under a neutral namespace, so end users don't have to depend on
// engine crates directly. These are feature-gated.
pub mod backends {
    #[cfg(feature = "libsql-backend")]
    pub use datarepo_libsql::{LibsqlConfig, LibsqlEngine};
    #[cfg(feature = "memory-backend")]
    pub use datarepo_memory::{MemoryConn, MemoryEngine};
}
