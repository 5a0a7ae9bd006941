//! The unit of work.
//!
//! A [`Session`] owns one engine connection, the persistence context (one snapshot per
//! managed row), the queue of pending removals and the transaction scope stack. Every
//! repository call takes the session explicitly.

use std::collections::HashMap;

use crate::config::SessionConfig;
use crate::engine::Engine;
use crate::query::{BulkDelete, BulkUpdate, CountQuery, LockMode, SelectQuery, Selection};
use crate::transactions::{Propagation, TransactionDefinition, TransactionStatus};
use crate::{EntityKey, EntityMeta, ParamValue, Record, RepoError, RepoResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    /// The physical transaction.
    Root,
    /// Participates in the enclosing scope.
    Joined,
    Savepoint(String),
    /// Explicitly non-transactional scope; statements autocommit.
    NonTransactional,
}

pub struct Session<E: Engine> {
    engine: E,
    conn: E::Conn,
    config: SessionConfig,
    context: HashMap<(&'static str, EntityKey), Record>,
    pending_deletes: Vec<(EntityMeta, EntityKey)>,
    frames: Vec<Frame>,
    rollback_only: bool,
    savepoints: u32,
}

impl<E: Engine> Session<E> {
    pub async fn open(engine: &E) -> RepoResult<Self> {
        Self::open_with(engine, SessionConfig::default()).await
    }

    pub async fn open_with(engine: &E, config: SessionConfig) -> RepoResult<Self> {
        let conn = engine.connect().await?;
        Ok(Self {
            engine: engine.clone(),
            conn,
            config,
            context: HashMap::new(),
            pending_deletes: Vec::new(),
            frames: Vec::new(),
            rollback_only: false,
            savepoints: 0,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True while a physical transaction is open on this session's connection.
    pub fn in_transaction(&self) -> bool {
        self.frames.contains(&Frame::Root)
    }

    /// Status of the innermost scope, `None` outside any scope.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        let mut status = match self.frames.last()? {
            Frame::Root | Frame::Savepoint(_) => TransactionStatus::new(true),
            Frame::Joined | Frame::NonTransactional => TransactionStatus::new(false),
        };
        if self.rollback_only {
            status.set_rollback_only();
        }
        Some(status)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Begin a scope with the session's default definition.
    pub async fn begin(&mut self) -> RepoResult<()> {
        let def = self.config.default_transaction.clone();
        self.begin_with(&def).await
    }

    pub async fn begin_with(&mut self, def: &TransactionDefinition) -> RepoResult<()> {
        let active = self.in_transaction();
        let frame = match (def.propagation, active) {
            (Propagation::Never, true) => {
                return Err(RepoError::IllegalTransactionState(
                    "transaction exists but Propagation::Never requested".into(),
                ))
            }
            (Propagation::Never | Propagation::Supports | Propagation::NotSupported, false) => {
                Frame::NonTransactional
            }
            (Propagation::Required | Propagation::Supports | Propagation::NotSupported, true) => {
                Frame::Joined
            }
            (Propagation::RequiresNew | Propagation::Nested, true) => {
                self.flush().await?;
                self.savepoints += 1;
                let name = format!("sp{}", self.savepoints);
                self.engine.savepoint(&mut self.conn, &name).await?;
                Frame::Savepoint(name)
            }
            (Propagation::Required | Propagation::RequiresNew | Propagation::Nested, false) => {
                self.flush().await?;
                self.engine.begin(&mut self.conn, def).await?;
                self.rollback_only = false;
                Frame::Root
            }
        };
        tracing::debug!(propagation = ?def.propagation, scope = ?frame, "begin");
        self.frames.push(frame);
        Ok(())
    }

    /// End the innermost scope. Pending removals are flushed first; a root transaction
    /// marked rollback-only is rolled back instead.
    pub async fn commit(&mut self) -> RepoResult<()> {
        let frame = self.frames.pop().ok_or_else(|| {
            RepoError::IllegalTransactionState("no transaction scope to commit".into())
        })?;
        tracing::debug!(scope = ?frame, rollback_only = self.rollback_only, "commit");
        match frame {
            Frame::Joined => Ok(()),
            Frame::NonTransactional => self.flush().await,
            Frame::Savepoint(name) => {
                if let Err(e) = self.flush().await {
                    self.engine.rollback_to_savepoint(&mut self.conn, &name).await?;
                    self.clear();
                    return Err(e);
                }
                self.engine.release_savepoint(&mut self.conn, &name).await
            }
            Frame::Root => {
                if self.rollback_only {
                    return self.rollback_root().await;
                }
                if let Err(e) = self.flush().await {
                    self.rollback_root().await?;
                    return Err(e);
                }
                if let Err(e) = self.engine.commit(&mut self.conn).await {
                    // The frame is gone, so the connection must not keep a transaction.
                    if let Err(rollback) = self.rollback_root().await {
                        tracing::warn!(error = %rollback, "rollback after failed commit");
                    }
                    return Err(e);
                }
                self.savepoints = 0;
                Ok(())
            }
        }
    }

    /// Roll back the innermost scope. A joined scope marks the enclosing transaction
    /// rollback-only. The persistence context is cleared whenever writes are undone.
    pub async fn rollback(&mut self) -> RepoResult<()> {
        let frame = self.frames.pop().ok_or_else(|| {
            RepoError::IllegalTransactionState("no transaction scope to roll back".into())
        })?;
        tracing::debug!(scope = ?frame, "rollback");
        match frame {
            Frame::Joined => {
                if self.in_transaction() {
                    self.rollback_only = true;
                }
                Ok(())
            }
            Frame::NonTransactional => {
                self.clear();
                Ok(())
            }
            Frame::Savepoint(name) => {
                self.clear();
                self.engine.rollback_to_savepoint(&mut self.conn, &name).await?;
                self.engine.release_savepoint(&mut self.conn, &name).await
            }
            Frame::Root => self.rollback_root().await,
        }
    }

    async fn rollback_root(&mut self) -> RepoResult<()> {
        self.clear();
        self.rollback_only = false;
        self.savepoints = 0;
        self.engine.rollback(&mut self.conn).await
    }

    /// Mark the current transaction so that its commit rolls back.
    pub fn set_rollback_only(&mut self) -> RepoResult<()> {
        if !self.in_transaction() {
            return Err(RepoError::IllegalTransactionState(
                "no transaction to mark rollback-only".into(),
            ));
        }
        self.rollback_only = true;
        Ok(())
    }

    /// Execute queued removals.
    pub async fn flush(&mut self) -> RepoResult<()> {
        if self.pending_deletes.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_deletes);
        tracing::debug!(deletes = pending.len(), "flush");
        for (i, (meta, key)) in pending.iter().enumerate() {
            if let Err(e) = self
                .engine
                .delete(&mut self.conn, meta, &key.to_param())
                .await
            {
                // Keep what was not executed so a retry or rollback sees it.
                self.pending_deletes.extend(pending[i..].iter().cloned());
                return Err(e.during("flush"));
            }
        }
        Ok(())
    }

    /// Detach every managed instance and discard queued removals.
    pub fn clear(&mut self) {
        self.context.clear();
        self.pending_deletes.clear();
    }

    /// The managed snapshot for a row, unless its removal is queued.
    pub fn cached(&self, meta: &EntityMeta, key: &EntityKey) -> Option<&Record> {
        if self.is_pending_delete(meta, key) {
            return None;
        }
        self.context.get(&(meta.table, key.clone()))
    }

    pub fn contains(&self, meta: &EntityMeta, key: &EntityKey) -> bool {
        self.cached(meta, key).is_some()
    }

    pub fn manage(&mut self, meta: &EntityMeta, key: EntityKey, record: Record) {
        self.context.insert((meta.table, key), record);
    }

    pub fn evict(&mut self, meta: &EntityMeta, key: &EntityKey) {
        self.context.remove(&(meta.table, key.clone()));
    }

    pub fn managed_count(&self) -> usize {
        self.context.len()
    }

    pub fn is_pending_delete(&self, meta: &EntityMeta, key: &EntityKey) -> bool {
        self.pending_deletes
            .iter()
            .any(|(m, k)| m.table == meta.table && k == key)
    }

    /// Queue a removal; the row is deleted on the next flush.
    pub fn queue_delete(&mut self, meta: &EntityMeta, key: EntityKey) {
        self.evict(meta, &key);
        if !self.is_pending_delete(meta, &key) {
            self.pending_deletes.push((*meta, key));
        }
    }

    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.len()
    }

    async fn auto_flush(&mut self) -> RepoResult<()> {
        if self.config.auto_flush {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn select(&mut self, query: &SelectQuery) -> RepoResult<Vec<Record>> {
        if query.lock != LockMode::None && !self.in_transaction() {
            return Err(RepoError::TransactionRequired {
                operation: "pessimistic locking",
            });
        }
        self.auto_flush().await?;
        let mut rows = self.engine.select(&mut self.conn, query).await?;
        if !self.pending_deletes.is_empty() && query.selection == Selection::Entity {
            let meta = query.entity;
            rows.retain(|row| {
                row.get(meta.id_column)
                    .and_then(ParamValue::entity_key)
                    .map_or(true, |k| !self.is_pending_delete(&meta, &k))
            });
        }
        Ok(rows)
    }

    pub async fn count(&mut self, query: &CountQuery) -> RepoResult<u64> {
        self.auto_flush().await?;
        self.engine.count(&mut self.conn, query).await
    }

    pub async fn insert(&mut self, meta: &EntityMeta, values: &Record) -> RepoResult<ParamValue> {
        self.engine.insert(&mut self.conn, meta, values).await
    }

    pub async fn update(
        &mut self,
        meta: &EntityMeta,
        key: &ParamValue,
        values: &Record,
    ) -> RepoResult<u64> {
        self.engine.update(&mut self.conn, meta, key, values).await
    }

    /// Runs straight against the engine. Managed instances keep their old values.
    pub async fn bulk_update(&mut self, stmt: &BulkUpdate) -> RepoResult<u64> {
        self.auto_flush().await?;
        self.engine.bulk_update(&mut self.conn, stmt).await
    }

    /// Runs straight against the engine. Managed instances are not detached.
    pub async fn bulk_delete(&mut self, stmt: &BulkDelete) -> RepoResult<u64> {
        self.auto_flush().await?;
        self.engine.bulk_delete(&mut self.conn, stmt).await
    }

    /// Roll back anything still open and release the connection.
    pub async fn close(mut self) -> RepoResult<()> {
        if self.in_transaction() {
            self.rollback_root().await?;
        } else {
            self.flush().await?;
        }
        self.frames.clear();
        Ok(())
    }
}

impl<E: Engine> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("managed", &self.context.len())
            .field("pending_deletes", &self.pending_deletes.len())
            .field("frames", &self.frames)
            .field("rollback_only", &self.rollback_only)
            .finish_non_exhaustive()
    }
}
