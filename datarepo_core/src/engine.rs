//! The persistence engine boundary.
//!
//! An engine owns storage and connections. Repositories never talk to an engine
//! directly; they go through a [`Session`](crate::session::Session), which holds one
//! connection for the whole unit of work.

use async_trait::async_trait;

use crate::query::{BulkDelete, BulkUpdate, CountQuery, SelectQuery};
use crate::transactions::TransactionDefinition;
use crate::{EntityMeta, ParamValue, Record, RepoResult};

#[async_trait]
pub trait Engine: Send + Sync + Clone + 'static {
    /// One connection; dropping it without commit rolls back any open transaction.
    type Conn: Send;

    async fn connect(&self) -> RepoResult<Self::Conn>;

    async fn begin(&self, conn: &mut Self::Conn, def: &TransactionDefinition) -> RepoResult<()>;
    async fn commit(&self, conn: &mut Self::Conn) -> RepoResult<()>;
    async fn rollback(&self, conn: &mut Self::Conn) -> RepoResult<()>;

    async fn savepoint(&self, conn: &mut Self::Conn, name: &str) -> RepoResult<()>;
    async fn release_savepoint(&self, conn: &mut Self::Conn, name: &str) -> RepoResult<()>;
    async fn rollback_to_savepoint(&self, conn: &mut Self::Conn, name: &str) -> RepoResult<()>;

    /// Rows named as described by [`crate::query::Selection`].
    async fn select(&self, conn: &mut Self::Conn, query: &SelectQuery) -> RepoResult<Vec<Record>>;
    async fn count(&self, conn: &mut Self::Conn, query: &CountQuery) -> RepoResult<u64>;

    /// Insert a row and return its key: the key column of `values` when present and
    /// non-null, otherwise a generated one.
    async fn insert(
        &self,
        conn: &mut Self::Conn,
        meta: &EntityMeta,
        values: &Record,
    ) -> RepoResult<ParamValue>;

    /// Update the row with `key`, returning the number of rows changed (0 or 1).
    async fn update(
        &self,
        conn: &mut Self::Conn,
        meta: &EntityMeta,
        key: &ParamValue,
        values: &Record,
    ) -> RepoResult<u64>;

    async fn delete(&self, conn: &mut Self::Conn, meta: &EntityMeta, key: &ParamValue)
        -> RepoResult<u64>;

    async fn bulk_update(&self, conn: &mut Self::Conn, stmt: &BulkUpdate) -> RepoResult<u64>;
    async fn bulk_delete(&self, conn: &mut Self::Conn, stmt: &BulkDelete) -> RepoResult<u64>;
}
