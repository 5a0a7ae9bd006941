#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "libsql-backend"),
    doc = "Enable feature `libsql-backend` to use this engine."
)]
//! A libsql/SQLite [`Engine`](datarepo_core::engine::Engine).
//!
//! Queries are rendered by `datarepo_sql_builder` with `?` placeholders. Result
//! columns are named the way the builder aliases them, so rows come back as records
//! with `column` and `relation.column` names.
//!
//! SQLite has no row locks. Pessimistic lock modes are accepted inside a transaction
//! and otherwise ignored: writers are serialized per database, and
//! `Isolation::RepeatableRead`/`Serializable` open the transaction with
//! `BEGIN IMMEDIATE`/`BEGIN EXCLUSIVE`.

use serde::Deserialize;

use datarepo_core::{RepoError, RepoResult};

/// Connection settings for [`LibsqlEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LibsqlConfig {
    /// Path of the local database file.
    pub url: String,
    /// `PRAGMA busy_timeout` applied to every connection.
    pub busy_timeout_ms: u64,
}

impl Default for LibsqlConfig {
    fn default() -> Self {
        Self {
            url: "datarepo.sqlite3".into(),
            busy_timeout_ms: 1000,
        }
    }
}

impl LibsqlConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> RepoResult<Self> {
        serde_json::from_str(json).map_err(|e| RepoError::Config {
            source: Box::new(e),
        })
    }
}

#[cfg(feature = "libsql-backend")]
mod backend {
    use std::fmt;
    use std::sync::Arc;
    use std::time::Instant;

    use async_trait::async_trait;
    use datarepo_core::engine::Engine;
    use datarepo_core::query::{BulkDelete, BulkUpdate, CountQuery, LockMode, SelectQuery};
    use datarepo_core::transactions::{Isolation, TransactionDefinition};
    use datarepo_core::{EntityMeta, ParamValue, Record, RepoError, RepoResult};
    use datarepo_sql_builder::{output_columns, Placeholder, SqlBuilder, Statement};
    use libsql::{Connection, Database, Value};

    use crate::LibsqlConfig;

    #[cfg(feature = "tracing")]
    use tracing::info;

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, table: &str, start: Instant, rows: usize, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                sql_kind = "sql",
                table = table,
                op = op,
                rows = rows,
                elapsed_ms = elapsed,
                success = success,
                "repo op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("repo_ops_total", 1, "op" => op.to_string(), "table" => table.to_string(), "success" => success.to_string());
            metrics::histogram!("repo_op_duration_ms", elapsed as f64, "op" => op.to_string(), "table" => table.to_string());
            if !success {
                metrics::counter!("repo_op_errors_total", 1, "op" => op.to_string(), "table" => table.to_string());
            }
        }
    }

    fn observed<T>(
        op: &str,
        table: &str,
        start: Instant,
        result: RepoResult<T>,
        rows: impl FnOnce(&T) -> usize,
    ) -> RepoResult<T> {
        match &result {
            Ok(v) => obs_record(op, table, start, rows(v), true),
            Err(_) => obs_record(op, table, start, 0, false),
        }
        result
    }

    fn begin_sql(isolation: Isolation) -> &'static str {
        match isolation {
            Isolation::Default | Isolation::ReadCommitted => "BEGIN DEFERRED",
            Isolation::RepeatableRead => "BEGIN IMMEDIATE",
            Isolation::Serializable => "BEGIN EXCLUSIVE",
        }
    }

    #[derive(Debug, thiserror::Error)]
    enum LibsqlError {
        #[error("a transaction is already active on this connection")]
        AlreadyInTransaction,
        #[error("no active transaction")]
        NoTransaction,
        #[error("list values must be expanded before binding")]
        UnexpandedList,
        #[error("unsupported column value: {0}")]
        UnsupportedValue(&'static str),
        #[error("statement returned no row")]
        NoRow,
    }

    // Helper function to convert ParamValue to libsql::Value.
    fn to_libsql_value(p: ParamValue) -> RepoResult<Value> {
        Ok(match p {
            ParamValue::String(s) => Value::Text(s),
            ParamValue::I32(i) => Value::Integer(i64::from(i)), // libsql uses i64 for integers
            ParamValue::I64(i) => Value::Integer(i),
            ParamValue::F64(f) => Value::Real(f),
            ParamValue::Bool(b) => Value::Integer(i64::from(b)), // SQLite bools are 0/1
            ParamValue::Null => Value::Null,
            ParamValue::List(_) => return Err(RepoError::backend(LibsqlError::UnexpandedList)),
        })
    }

    fn from_libsql_value(v: Value) -> RepoResult<ParamValue> {
        Ok(match v {
            Value::Null => ParamValue::Null,
            Value::Integer(i) => ParamValue::I64(i),
            Value::Real(f) => ParamValue::F64(f),
            Value::Text(s) => ParamValue::String(s),
            Value::Blob(_) => return Err(RepoError::mapping(LibsqlError::UnsupportedValue("blob"))),
        })
    }

    fn values(params: Vec<ParamValue>) -> RepoResult<Vec<Value>> {
        params.into_iter().map(to_libsql_value).collect()
    }

    /// A libsql-backed engine. Cloning shares the database handle.
    #[derive(Clone)]
    pub struct LibsqlEngine {
        db: Arc<Database>,
        config: LibsqlConfig,
        sql: SqlBuilder,
    }

    impl fmt::Debug for LibsqlEngine {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("LibsqlEngine")
                .field("config", &self.config)
                .finish_non_exhaustive()
        }
    }

    /// One libsql connection plus the transaction state the engine tracks for it.
    /// Dropping it closes the connection, which rolls back an open transaction.
    pub struct LibsqlConn {
        conn: Connection,
        tx: Option<TransactionDefinition>,
    }

    impl LibsqlConn {
        pub fn in_transaction(&self) -> bool {
            self.tx.is_some()
        }

        /// The raw driver connection, for statements the query model cannot express.
        pub fn raw(&self) -> &Connection {
            &self.conn
        }
    }

    impl LibsqlEngine {
        /// Open (or create) the local database at `config.url`.
        pub async fn open(config: LibsqlConfig) -> RepoResult<Self> {
            let db = libsql::Builder::new_local(&config.url)
                .build()
                .await
                .map_err(RepoError::backend)?;
            Ok(Self::from_database(Arc::new(db), config))
        }

        /// Wrap an existing database handle.
        pub fn from_database(db: Arc<Database>, config: LibsqlConfig) -> Self {
            Self {
                db,
                config,
                sql: SqlBuilder::new(Placeholder::Question),
            }
        }

        pub fn config(&self) -> &LibsqlConfig {
            &self.config
        }

        /// Run a batch of semicolon-separated statements, e.g. a schema migration.
        pub async fn execute_batch(&self, sql: &str) -> RepoResult<()> {
            let conn = self.db.connect().map_err(RepoError::backend)?;
            conn.execute_batch(sql).await.map_err(RepoError::backend)?;
            Ok(())
        }

        async fn exec(&self, conn: &LibsqlConn, (sql, params): Statement) -> RepoResult<u64> {
            conn.conn
                .execute(&sql, values(params)?)
                .await
                .map_err(RepoError::backend)
        }

        async fn busy_timeout(&self, conn: &Connection, ms: u64) -> RepoResult<()> {
            // The pragma answers with the new value, so it is issued as a query.
            conn.query(&format!("PRAGMA busy_timeout = {ms}"), ())
                .await
                .map_err(RepoError::backend)?;
            Ok(())
        }

        async fn end(&self, conn: &mut LibsqlConn, sql: &str) -> RepoResult<()> {
            let def = conn
                .tx
                .take()
                .ok_or_else(|| RepoError::backend(LibsqlError::NoTransaction))?;
            let result = conn.conn.execute(sql, ()).await.map_err(RepoError::backend);
            if def.read_only {
                conn.conn
                    .execute("PRAGMA query_only = OFF", ())
                    .await
                    .map_err(RepoError::backend)?;
            }
            if def.timeout.is_some() {
                self.busy_timeout(&conn.conn, self.config.busy_timeout_ms).await?;
            }
            result.map(|_| ())
        }
    }

    #[async_trait]
    impl Engine for LibsqlEngine {
        type Conn = LibsqlConn;

        async fn connect(&self) -> RepoResult<LibsqlConn> {
            let conn = self.db.connect().map_err(RepoError::backend)?;
            self.busy_timeout(&conn, self.config.busy_timeout_ms).await?;
            Ok(LibsqlConn { conn, tx: None })
        }

        async fn begin(&self, conn: &mut LibsqlConn, def: &TransactionDefinition) -> RepoResult<()> {
            if conn.tx.is_some() {
                return Err(RepoError::backend(LibsqlError::AlreadyInTransaction));
            }
            if def.read_only {
                conn.conn
                    .execute("PRAGMA query_only = ON", ())
                    .await
                    .map_err(RepoError::backend)?;
            }
            if let Some(timeout) = def.timeout {
                self.busy_timeout(&conn.conn, timeout.as_millis() as u64).await?;
            }
            conn.conn
                .execute(begin_sql(def.isolation), ())
                .await
                .map_err(RepoError::backend)?;
            conn.tx = Some(def.clone());
            Ok(())
        }

        async fn commit(&self, conn: &mut LibsqlConn) -> RepoResult<()> {
            self.end(conn, "COMMIT").await
        }

        async fn rollback(&self, conn: &mut LibsqlConn) -> RepoResult<()> {
            self.end(conn, "ROLLBACK").await
        }

        async fn savepoint(&self, conn: &mut LibsqlConn, name: &str) -> RepoResult<()> {
            conn.conn
                .execute(&format!("SAVEPOINT {name}"), ())
                .await
                .map_err(RepoError::backend)?;
            Ok(())
        }

        async fn release_savepoint(&self, conn: &mut LibsqlConn, name: &str) -> RepoResult<()> {
            conn.conn
                .execute(&format!("RELEASE SAVEPOINT {name}"), ())
                .await
                .map_err(RepoError::backend)?;
            Ok(())
        }

        async fn rollback_to_savepoint(&self, conn: &mut LibsqlConn, name: &str) -> RepoResult<()> {
            conn.conn
                .execute(&format!("ROLLBACK TO SAVEPOINT {name}"), ())
                .await
                .map_err(RepoError::backend)?;
            Ok(())
        }

        async fn select(&self, conn: &mut LibsqlConn, query: &SelectQuery) -> RepoResult<Vec<Record>> {
            let start = Instant::now();
            let result = async {
                if query.lock != LockMode::None && conn.tx.is_none() {
                    return Err(RepoError::TransactionRequired {
                        operation: "pessimistic locking",
                    });
                }
                let (sql, params) = self.sql.select(query)?;
                let names = output_columns(query)?;
                let mut rows = conn
                    .conn
                    .query(&sql, values(params)?)
                    .await
                    .map_err(RepoError::backend)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().await.map_err(RepoError::backend)? {
                    let mut record = Record::new();
                    for (i, name) in names.iter().enumerate() {
                        let value = row.get_value(i as i32).map_err(RepoError::mapping)?;
                        record.set(name.as_str(), from_libsql_value(value)?);
                    }
                    out.push(record);
                }
                Ok::<_, RepoError>(out)
            }
            .await;
            observed("select", query.entity.table, start, result, Vec::len)
        }

        async fn count(&self, conn: &mut LibsqlConn, query: &CountQuery) -> RepoResult<u64> {
            let start = Instant::now();
            let result = async {
                let (sql, params) = self.sql.count(query)?;
                let mut rows = conn
                    .conn
                    .query(&sql, values(params)?)
                    .await
                    .map_err(RepoError::backend)?;
                let row = rows
                    .next()
                    .await
                    .map_err(RepoError::backend)?
                    .ok_or_else(|| RepoError::backend(LibsqlError::NoRow))?;
                let n: i64 = row.get(0).map_err(RepoError::mapping)?;
                Ok::<_, RepoError>(n.max(0) as u64)
            }
            .await;
            observed("count", query.entity.table, start, result, |_| 1)
        }

        async fn insert(
            &self,
            conn: &mut LibsqlConn,
            meta: &EntityMeta,
            values: &Record,
        ) -> RepoResult<ParamValue> {
            let start = Instant::now();
            let result = async {
                self.exec(conn, self.sql.insert(meta, values)).await?;
                Ok::<_, RepoError>(match values.get(meta.id_column) {
                    Some(key) if !key.is_null() => key.clone(),
                    _ => ParamValue::I64(conn.conn.last_insert_rowid()),
                })
            }
            .await;
            observed("insert", meta.table, start, result, |_| 1)
        }

        async fn update(
            &self,
            conn: &mut LibsqlConn,
            meta: &EntityMeta,
            key: &ParamValue,
            values: &Record,
        ) -> RepoResult<u64> {
            let start = Instant::now();
            let result = self.exec(conn, self.sql.update_by_id(meta, key, values)).await;
            observed("update", meta.table, start, result, |n| *n as usize)
        }

        async fn delete(&self, conn: &mut LibsqlConn, meta: &EntityMeta, key: &ParamValue) -> RepoResult<u64> {
            let start = Instant::now();
            let result = self.exec(conn, self.sql.delete_by_id(meta, key)).await;
            observed("delete", meta.table, start, result, |n| *n as usize)
        }

        async fn bulk_update(&self, conn: &mut LibsqlConn, stmt: &BulkUpdate) -> RepoResult<u64> {
            let start = Instant::now();
            let result = match self.sql.bulk_update(stmt) {
                Ok(statement) => self.exec(conn, statement).await,
                Err(e) => Err(e.into()),
            };
            observed("bulk_update", stmt.entity.table, start, result, |n| *n as usize)
        }

        async fn bulk_delete(&self, conn: &mut LibsqlConn, stmt: &BulkDelete) -> RepoResult<u64> {
            let start = Instant::now();
            let result = match self.sql.bulk_delete(stmt) {
                Ok(statement) => self.exec(conn, statement).await,
                Err(e) => Err(e.into()),
            };
            observed("bulk_delete", stmt.entity.table, start, result, |n| *n as usize)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn begin_sql_follows_isolation() {
            assert_eq!(begin_sql(Isolation::Default), "BEGIN DEFERRED");
            assert_eq!(begin_sql(Isolation::ReadCommitted), "BEGIN DEFERRED");
            assert_eq!(begin_sql(Isolation::RepeatableRead), "BEGIN IMMEDIATE");
            assert_eq!(begin_sql(Isolation::Serializable), "BEGIN EXCLUSIVE");
        }

        #[test]
        fn values_map_to_sqlite_storage_classes() {
            assert!(matches!(to_libsql_value(ParamValue::Bool(true)), Ok(Value::Integer(1))));
            assert!(matches!(to_libsql_value(ParamValue::I32(7)), Ok(Value::Integer(7))));
            assert!(to_libsql_value(ParamValue::List(vec![])).is_err());
            assert_eq!(from_libsql_value(Value::Integer(3)).unwrap(), ParamValue::I64(3));
            assert_eq!(from_libsql_value(Value::Null).unwrap(), ParamValue::Null);
            assert!(from_libsql_value(Value::Blob(vec![1])).is_err());
        }
    }
}

#[cfg(feature = "libsql-backend")]
pub use backend::{LibsqlConn, LibsqlEngine};
