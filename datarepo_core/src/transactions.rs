//! Transaction definitions and a template that scopes a unit of work in a transaction.
//! Propagation is resolved by the [`Session`]; engines only see begin/commit/rollback
//! and savepoints.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::engine::Engine;
use crate::session::Session;
use crate::RepoResult;

/// Transaction propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    Required,
    /// A savepoint when a transaction is active (one session has one connection).
    RequiresNew,
    Supports,
    /// Runs without a transaction when none is active, otherwise joins it.
    NotSupported,
    Never,
    Nested,
}

/// Transaction isolation level (best-effort across backends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction definition describing desired semantics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: Isolation,
    pub read_only: bool,
    pub timeout: Option<Duration>,
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self {
            propagation: Propagation::Required,
            isolation: Isolation::Default,
            read_only: false,
            timeout: None,
        }
    }
}

impl TransactionDefinition {
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Status of the innermost transaction scope of a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatus {
    new: bool,
    rollback_only: bool,
}

impl TransactionStatus {
    pub fn new(is_new: bool) -> Self {
        Self {
            new: is_new,
            rollback_only: false,
        }
    }
    pub fn is_new_transaction(&self) -> bool {
        self.new
    }
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }
}

/// Runs a callback inside a transaction scope: commit on `Ok`, rollback on `Err`.
///
/// The callback's future borrows the session; anything else it uses should be moved
/// in (repositories are cheap to clone).
#[derive(Debug, Clone, Default)]
pub struct TransactionTemplate {
    defaults: TransactionDefinition,
}

impl TransactionTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self, def: TransactionDefinition) -> Self {
        self.defaults = def;
        self
    }

    pub fn defaults(&self) -> &TransactionDefinition {
        &self.defaults
    }

    pub async fn execute<E, R, F>(&self, session: &mut Session<E>, f: F) -> RepoResult<R>
    where
        E: Engine,
        F: for<'s> FnOnce(&'s mut Session<E>) -> BoxFuture<'s, RepoResult<R>> + Send,
        R: Send,
    {
        self.execute_with(&self.defaults, session, f).await
    }

    pub async fn execute_with<E, R, F>(
        &self,
        def: &TransactionDefinition,
        session: &mut Session<E>,
        f: F,
    ) -> RepoResult<R>
    where
        E: Engine,
        F: for<'s> FnOnce(&'s mut Session<E>) -> BoxFuture<'s, RepoResult<R>> + Send,
        R: Send,
    {
        session.begin_with(def).await?;
        match f(session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed callback also failed");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_status_basic_behaviour() {
        let def = TransactionDefinition::default();
        assert_eq!(def.propagation, Propagation::Required);
        assert_eq!(def.isolation, Isolation::Default);
        assert!(!def.read_only);
        assert!(def.timeout.is_none());

        let mut st = TransactionStatus::new(true);
        assert!(st.is_new_transaction());
        assert!(!st.is_rollback_only());
        st.set_rollback_only();
        assert!(st.is_rollback_only());
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let def: TransactionDefinition =
            serde_json::from_str(r#"{"propagation":"requires_new","read_only":true}"#).unwrap();
        assert_eq!(def.propagation, Propagation::RequiresNew);
        assert_eq!(def.isolation, Isolation::Default);
        assert!(def.read_only);

        let def = TransactionDefinition::default()
            .with_propagation(Propagation::Nested)
            .read_only();
        assert_eq!(def.propagation, Propagation::Nested);
        assert!(def.read_only);
    }

    #[test]
    fn template_with_defaults_overrides_definition() {
        let expected = TransactionDefinition {
            propagation: Propagation::RequiresNew,
            isolation: Isolation::Serializable,
            read_only: true,
            timeout: Some(Duration::from_secs(1)),
        };
        let tpl = TransactionTemplate::new().with_defaults(expected.clone());
        assert_eq!(tpl.defaults(), &expected);
    }
}
