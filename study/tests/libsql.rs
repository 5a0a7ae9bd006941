#![cfg(feature = "libsql-backend")]

use std::sync::atomic::{AtomicUsize, Ordering};

use datarepo::backends::{LibsqlConfig, LibsqlEngine};
use datarepo::{RepoError, RepoResult};
use study::scenarios::{self, EngineFactory};

/// One fresh database file per scenario, all inside a temp dir that lives as long as
/// the factory.
struct LibsqlFactory {
    dir: tempfile::TempDir,
    next: AtomicUsize,
}

impl LibsqlFactory {
    fn new() -> RepoResult<Self> {
        Ok(Self {
            dir: tempfile::tempdir().map_err(RepoError::backend)?,
            next: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl EngineFactory for LibsqlFactory {
    type Engine = LibsqlEngine;

    async fn engine(&self) -> RepoResult<LibsqlEngine> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.path().join(format!("study-{n}.sqlite3"));
        let engine = LibsqlEngine::open(LibsqlConfig::new(path.to_string_lossy())).await?;
        engine
            .execute_batch(study::migrations::LIBSQL_SCHEMA_SQL)
            .await?;
        Ok(engine)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn libsql_repository_scenarios() -> RepoResult<()> {
    let factory = LibsqlFactory::new()?;
    scenarios::test_member_crud(&factory).await?;
    scenarios::test_find_by_username_and_age_greater_than(&factory).await?;
    scenarios::test_query_methods(&factory).await?;
    scenarios::test_paging(&factory).await?;
    scenarios::test_sort_by_team_name(&factory).await?;
    scenarios::test_literal_like_arguments(&factory).await?;
    scenarios::test_bulk_update(&factory).await?;
    scenarios::test_specifications(&factory).await?;
    scenarios::test_fetch_strategies(&factory).await?;
    scenarios::test_read_only_hint(&factory).await?;
    scenarios::test_projections(&factory).await?;
    scenarios::test_custom_repository(&factory).await?;
    scenarios::test_deletes(&factory).await?;
    scenarios::test_transactions(&factory).await?;
    scenarios::test_lock_requires_transaction(&factory).await?;
    scenarios::test_items_and_teams(&factory).await?;
    Ok(())
}
