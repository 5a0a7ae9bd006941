use datarepo::backends::MemoryEngine;
use datarepo::config::SessionConfig;
use datarepo::derived::DerivedQuery;
use datarepo::ql::TextQuery;
use datarepo::{PageRequest, RepoError, RepoResult, Repository, Session, Sort};
use study::scenarios::{self, EngineFactory};
use study::{Member, MemberRepository};

struct MemoryFactory;

#[async_trait::async_trait]
impl EngineFactory for MemoryFactory {
    type Engine = MemoryEngine;

    async fn engine(&self) -> RepoResult<MemoryEngine> {
        Ok(MemoryEngine::new())
    }
}

#[tokio::test]
async fn member_crud() -> RepoResult<()> {
    scenarios::test_member_crud(&MemoryFactory).await
}

#[tokio::test]
async fn find_by_username_and_age_greater_than() -> RepoResult<()> {
    scenarios::test_find_by_username_and_age_greater_than(&MemoryFactory).await
}

#[tokio::test]
async fn query_methods() -> RepoResult<()> {
    scenarios::test_query_methods(&MemoryFactory).await
}

#[tokio::test]
async fn paging() -> RepoResult<()> {
    scenarios::test_paging(&MemoryFactory).await
}

#[tokio::test]
async fn sort_by_team_name() -> RepoResult<()> {
    scenarios::test_sort_by_team_name(&MemoryFactory).await
}

#[tokio::test]
async fn literal_like_arguments() -> RepoResult<()> {
    scenarios::test_literal_like_arguments(&MemoryFactory).await
}

#[tokio::test]
async fn bulk_update() -> RepoResult<()> {
    scenarios::test_bulk_update(&MemoryFactory).await
}

#[tokio::test]
async fn specifications() -> RepoResult<()> {
    scenarios::test_specifications(&MemoryFactory).await
}

#[tokio::test]
async fn fetch_strategies() -> RepoResult<()> {
    scenarios::test_fetch_strategies(&MemoryFactory).await
}

#[tokio::test]
async fn read_only_hint() -> RepoResult<()> {
    scenarios::test_read_only_hint(&MemoryFactory).await
}

#[tokio::test]
async fn projections() -> RepoResult<()> {
    scenarios::test_projections(&MemoryFactory).await
}

#[tokio::test]
async fn custom_repository() -> RepoResult<()> {
    scenarios::test_custom_repository(&MemoryFactory).await
}

#[tokio::test]
async fn deletes() -> RepoResult<()> {
    scenarios::test_deletes(&MemoryFactory).await
}

#[tokio::test]
async fn transactions() -> RepoResult<()> {
    scenarios::test_transactions(&MemoryFactory).await
}

#[tokio::test]
async fn lock_requires_transaction() -> RepoResult<()> {
    scenarios::test_lock_requires_transaction(&MemoryFactory).await
}

#[tokio::test]
async fn items_and_teams() -> RepoResult<()> {
    scenarios::test_items_and_teams(&MemoryFactory).await
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_member_rejects_other_sessions() -> RepoResult<()> {
    let engine = MemoryEngine::new();
    let members = MemberRepository::new()?;
    let mut a = Session::open(&engine).await?;
    let mut b = Session::open(&engine).await?;

    let saved = members.save(&mut a, Member::with_age("member1", 10)).await?;

    a.begin().await?;
    let locked = members.find_lock_by_username(&mut a, "member1".into()).await?;
    assert_eq!(locked.len(), 1);
    assert_eq!(engine.locked_rows(), 1);

    let mut older = saved.clone();
    older.age = 11;
    let err = members.save(&mut b, older.clone()).await.unwrap_err();
    assert!(err.is_lock_unavailable());

    a.commit().await?;
    assert_eq!(engine.locked_rows(), 0);
    members.save(&mut b, older).await?;
    b.clear();
    let reread = members.find_by_id(&mut b, &saved.id.unwrap()).await?;
    assert_eq!(reread.map(|m| m.age), Some(11));
    Ok(())
}

#[test]
fn unknown_properties_fail_parsing() {
    assert!(DerivedQuery::parse::<Member>("find_by_nickname").is_err());
    assert!(DerivedQuery::parse::<Member>("find_by_username_and").is_err());
    assert!(TextQuery::parse::<Member>("select m form Member m").is_err());
    assert!(TextQuery::parse::<Member>("select m from Member m where m.nickname = :n").is_err());
}

#[tokio::test]
async fn session_config_caps_page_size() -> RepoResult<()> {
    let engine = MemoryEngine::new();
    let config = SessionConfig::from_json(r#"{"max_page_size": 2}"#)?;
    let mut session = Session::open_with(&engine, config).await?;
    let members = MemberRepository::new()?;
    for i in 1..=5 {
        members
            .save(&mut session, Member::with_age(format!("member{i}"), 10))
            .await?;
    }

    let page = members
        .find_by_age(&mut session, 10, &PageRequest::of_sorted(0, 10, Sort::asc("id")))
        .await?;
    assert_eq!(page.size(), 2);
    assert_eq!(page.number_of_elements(), 2);
    assert_eq!(page.total_pages(), 3);
    Ok(())
}

#[tokio::test]
async fn session_close_discards_open_transaction() -> RepoResult<()> {
    let engine = MemoryEngine::new();
    let members = MemberRepository::new()?;
    let mut session = Session::open(&engine).await?;
    session.begin().await?;
    members.save(&mut session, Member::new("member1")).await?;
    session.close().await?;

    let mut fresh = Session::open(&engine).await?;
    assert_eq!(members.count(&mut fresh).await?, 0);
    assert!(matches!(
        fresh.commit().await,
        Err(RepoError::IllegalTransactionState(_))
    ));
    Ok(())
}
