use serde::Deserialize;

use crate::transactions::TransactionDefinition;
use crate::{RepoError, RepoResult};

/// Unit-of-work settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Flush queued deletes before queries, counts and bulk statements.
    pub auto_flush: bool,
    /// Upper bound applied to every page request.
    pub max_page_size: u64,
    /// Definition used by `Session::begin`.
    pub default_transaction: TransactionDefinition,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            max_page_size: 2000,
            default_transaction: TransactionDefinition::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> RepoResult<Self> {
        serde_json::from_str(json).map_err(RepoError::config)
    }
}
