//! Repository scenarios reusable across engines.
//!
//! Each `test_*` function opens its own store through an [`EngineFactory`], so engine
//! test suites only have to say how a fresh store with the tutorial schema is made.

use async_trait::async_trait;
use datarepo::{
    Engine, PageRequest, Propagation, Ref, RepoError, RepoResult, Repository, Session, Sort,
    SpecificationExecutor, TransactionDefinition, TransactionTemplate,
};

use crate::custom::MemberRepositoryCustom;
use crate::dto::{MemberDto, TeamInfo, UsernameOnly};
use crate::entity::{Item, Member, Team};
use crate::repository::{ItemRepository, MemberRepository, TeamRepository};
use crate::spec::MemberSpec;

#[async_trait]
pub trait EngineFactory: Sync {
    type Engine: Engine;

    /// A store with the tutorial schema and no rows.
    async fn engine(&self) -> RepoResult<Self::Engine>;
}

/// A store, a session on it and the member repository.
struct Fixture<E: Engine> {
    session: Session<E>,
    members: MemberRepository,
    teams: TeamRepository,
}

async fn fixture<F: EngineFactory>(f: &F) -> RepoResult<Fixture<F::Engine>> {
    let engine = f.engine().await?;
    Ok(Fixture {
        session: Session::open(&engine).await?,
        members: MemberRepository::new()?,
        teams: TeamRepository::new()?,
    })
}

fn key_of(member: &Member) -> RepoResult<i64> {
    member.id.ok_or(RepoError::NotFound)
}

fn usernames(members: &[Member]) -> Vec<&str> {
    members.iter().map(|m| m.username.as_str()).collect()
}

async fn save_team<E: Engine>(fx: &mut Fixture<E>, name: &str) -> RepoResult<Team> {
    fx.teams.save(&mut fx.session, Team::new(name)).await
}

/// Save, read back by key, count, then delete everything.
pub async fn test_member_crud<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let member1 = fx.members.save(&mut fx.session, Member::new("member1")).await?;
    let member2 = fx.members.save(&mut fx.session, Member::new("member2")).await?;

    let found1 = fx.members.find_by_id(&mut fx.session, &key_of(&member1)?).await?;
    let found2 = fx.members.find_by_id(&mut fx.session, &key_of(&member2)?).await?;
    assert_eq!(found1.as_ref(), Some(&member1));
    assert_eq!(found2.as_ref(), Some(&member2));

    // The same answer once the row has to come from the engine.
    fx.session.clear();
    let reread = fx.members.find_by_id(&mut fx.session, &key_of(&member1)?).await?;
    assert_eq!(reread, Some(member1.clone()));
    assert!(fx.members.exists_by_id(&mut fx.session, &key_of(&member2)?).await?);

    assert_eq!(fx.members.find_all(&mut fx.session).await?.len(), 2);
    assert_eq!(fx.members.count(&mut fx.session).await?, 2);

    let mut renamed = member1.clone();
    renamed.username = "member1-renamed".into();
    fx.members.save(&mut fx.session, renamed).await?;
    fx.session.clear();
    let reread = fx.members.find_by_id(&mut fx.session, &key_of(&member1)?).await?;
    assert_eq!(reread.map(|m| m.username), Some("member1-renamed".to_string()));

    fx.members.delete(&mut fx.session, &member1).await?;
    fx.members.delete(&mut fx.session, &member2).await?;
    assert_eq!(fx.session.pending_delete_count(), 2);
    assert_eq!(fx.members.count(&mut fx.session).await?, 0);
    assert!(fx.members.find_by_id(&mut fx.session, &key_of(&member1)?).await?.is_none());
    Ok(())
}

pub async fn test_find_by_username_and_age_greater_than<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    fx.members
        .save_all(
            &mut fx.session,
            vec![Member::with_age("AAA", 10), Member::with_age("AAA", 20)],
        )
        .await?;

    let result = fx
        .members
        .find_by_username_and_age_greater_than(&mut fx.session, "AAA".into(), 15)
        .await?;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].username, "AAA");
    assert_eq!(result[0].age, 20);
    Ok(())
}

/// Query-text methods: entity, scalar, constructor and `in` list results, plus
/// single-result finders.
pub async fn test_query_methods<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let team = save_team(&mut fx, "TeamA").await?;
    let aaa = fx
        .members
        .save(&mut fx.session, Member::in_team("AAA", 10, &team))
        .await?;
    fx.members.save(&mut fx.session, Member::with_age("BBB", 20)).await?;

    let found = fx.members.find_user(&mut fx.session, "AAA".into(), 10).await?;
    assert_eq!(usernames(&found), vec!["AAA"]);
    assert!(fx.members.find_user(&mut fx.session, "AAA".into(), 20).await?.is_empty());

    let names = fx.members.find_username_list(&mut fx.session).await?;
    assert_eq!(names, vec!["AAA".to_string(), "BBB".to_string()]);

    // The inner join drops BBB, which has no team.
    let dtos = fx.members.find_member_dto(&mut fx.session).await?;
    assert_eq!(
        dtos,
        vec![MemberDto {
            id: key_of(&aaa)?,
            username: "AAA".into(),
            team_name: "TeamA".into(),
        }]
    );

    let named = fx
        .members
        .find_by_names(
            &mut fx.session,
            vec!["AAA".to_string(), "BBB".to_string(), "CCC".to_string()],
        )
        .await?;
    assert_eq!(named.len(), 2);

    let optional = fx
        .members
        .find_optional_by_username(&mut fx.session, "AAA".into())
        .await?;
    assert_eq!(optional.map(|m| m.age), Some(10));
    assert!(fx
        .members
        .find_optional_by_username(&mut fx.session, "CCC".into())
        .await?
        .is_none());

    assert_eq!(fx.members.count_older_than(&mut fx.session, 15).await?, 1);
    assert_eq!(fx.members.count_by_age(&mut fx.session, 10).await?, 1);
    assert!(fx.members.exists_by_username(&mut fx.session, "BBB".into()).await?);
    assert!(!fx.members.exists_by_username(&mut fx.session, "CCC".into()).await?);

    fx.members.save(&mut fx.session, Member::with_age("AAA", 30)).await?;
    let err = fx
        .members
        .find_member_by_username(&mut fx.session, "AAA".into())
        .await
        .err();
    assert!(matches!(
        err,
        Some(RepoError::NonUniqueResult {
            expected: 1,
            actual: 2
        })
    ));
    Ok(())
}

/// Eight members aged 10, newest names first, three per page.
pub async fn test_paging<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    for i in 1..=8 {
        fx.members
            .save(&mut fx.session, Member::with_age(format!("member{i}"), 10))
            .await?;
    }

    let request = PageRequest::of_sorted(0, 3, Sort::desc("username"));
    let page = fx.members.find_by_age(&mut fx.session, 10, &request).await?;
    assert_eq!(usernames(page.content()), vec!["member8", "member7", "member6"]);
    assert_eq!(page.number(), 0);
    assert_eq!(page.total_elements(), 8);
    assert_eq!(page.total_pages(), 3);
    assert!(page.is_first());
    assert!(page.has_next());

    let last = fx
        .members
        .find_by_age(&mut fx.session, 10, &request.next().next())
        .await?;
    assert_eq!(usernames(last.content()), vec!["member2", "member1"]);
    assert!(last.is_last());
    assert!(last.has_previous());

    let slice = fx
        .members
        .find_slice_by_age(&mut fx.session, 10, &PageRequest::of_sorted(1, 3, Sort::desc("username")))
        .await?;
    assert_eq!(usernames(slice.content()), vec!["member5", "member4", "member3"]);
    assert!(slice.has_next());

    let empty = fx
        .members
        .find_by_age(&mut fx.session, 99, &PageRequest::of(0, 3))
        .await?;
    assert_eq!(empty.total_elements(), 0);
    assert!(!empty.has_next());

    let all = fx.members.find_page(&mut fx.session, &PageRequest::of(2, 3)).await?;
    assert_eq!(all.number_of_elements(), 2);

    let top = fx
        .members
        .find_top3_by_age_greater_than_order_by_age_desc(&mut fx.session, 5)
        .await?;
    assert_eq!(top.len(), 3);
    Ok(())
}

/// Sorting by a team attribute keeps members without a team; page content and totals
/// agree.
pub async fn test_sort_by_team_name<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let team_a = save_team(&mut fx, "teamA").await?;
    let team_b = save_team(&mut fx, "teamB").await?;
    fx.members
        .save_all(
            &mut fx.session,
            vec![
                Member::in_team("member1", 10, &team_b),
                Member::in_team("member2", 10, &team_a),
                Member::with_age("member3", 10),
            ],
        )
        .await?;
    fx.session.clear();

    // Members without a team sort first ascending.
    let sorted = fx
        .members
        .find_all_sorted(&mut fx.session, &Sort::asc("team.name"))
        .await?;
    assert_eq!(usernames(&sorted), vec!["member3", "member2", "member1"]);

    let request = PageRequest::of_sorted(0, 2, Sort::asc("team.name"));
    let first = fx.members.find_page(&mut fx.session, &request).await?;
    assert_eq!(usernames(first.content()), vec!["member3", "member2"]);
    assert_eq!(first.total_elements(), 3);
    assert!(first.has_next());

    let second = fx.members.find_page(&mut fx.session, &request.next()).await?;
    assert_eq!(usernames(second.content()), vec!["member1"]);
    assert!(second.is_last());

    let by_age = fx
        .members
        .find_by_age(&mut fx.session, 10, &PageRequest::of_sorted(0, 5, Sort::desc("team.name")))
        .await?;
    assert_eq!(by_age.total_elements(), 3);
    assert_eq!(usernames(by_age.content()), vec!["member1", "member2", "member3"]);
    Ok(())
}

/// Prefix and substring finders match the argument literally, wildcards included.
pub async fn test_literal_like_arguments<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    for name in ["abc", "a_c", "a%z", "x_y"] {
        fx.members.save(&mut fx.session, Member::new(name)).await?;
    }

    let prefixed = fx
        .members
        .find_by_username_starting_with(&mut fx.session, "a_".into())
        .await?;
    assert_eq!(usernames(&prefixed), vec!["a_c"]);
    let percent = fx
        .members
        .find_by_username_starting_with(&mut fx.session, "a%".into())
        .await?;
    assert_eq!(usernames(&percent), vec!["a%z"]);
    let plain = fx
        .members
        .find_by_username_starting_with(&mut fx.session, "a".into())
        .await?;
    assert_eq!(plain.len(), 3);

    let mut underscored = fx
        .members
        .find_by_username_containing(&mut fx.session, "_".into())
        .await?;
    underscored.sort_by(|a, b| a.username.cmp(&b.username));
    assert_eq!(usernames(&underscored), vec!["a_c", "x_y"]);
    Ok(())
}

/// A bulk update reports affected rows and leaves managed instances stale until the
/// session is cleared.
pub async fn test_bulk_update<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    for (name, age) in [
        ("member1", 10),
        ("member2", 19),
        ("member3", 20),
        ("member4", 21),
        ("member5", 10),
        ("member6", 40),
    ] {
        fx.members
            .save(&mut fx.session, Member::with_age(name, age))
            .await?;
    }

    let updated = fx.members.bulk_age_plus(&mut fx.session, 20).await?;
    assert_eq!(updated, 3);

    let stale = fx
        .members
        .find_by_username(&mut fx.session, "member6".into())
        .await?;
    assert_eq!(stale[0].age, 40);

    fx.session.flush().await?;
    fx.session.clear();
    let fresh = fx
        .members
        .find_by_username(&mut fx.session, "member6".into())
        .await?;
    assert_eq!(fresh[0].age, 41);

    let ages: Vec<i32> = fx
        .members
        .find_all_sorted(&mut fx.session, &Sort::asc("id"))
        .await?
        .iter()
        .map(|m| m.age)
        .collect();
    assert_eq!(ages, vec![10, 19, 21, 22, 10, 41]);

    // The clearing variant detaches everything it may have made stale.
    assert!(fx.session.managed_count() > 0);
    let cleared = fx.members.bulk_age_plus_and_clear(&mut fx.session, 41).await?;
    assert_eq!(cleared, 1);
    assert_eq!(fx.session.managed_count(), 0);

    let removed = fx
        .members
        .delete_named(&mut fx.session, vec!["member1".to_string(), "member5".to_string()])
        .await?;
    assert_eq!(removed, 2);
    assert_eq!(fx.members.count(&mut fx.session).await?, 4);
    Ok(())
}

pub async fn test_specifications<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let team_a = save_team(&mut fx, "teamA").await?;
    let team_b = save_team(&mut fx, "teamB").await?;
    fx.members
        .save_all(
            &mut fx.session,
            vec![
                Member::in_team("member1", 10, &team_a),
                Member::in_team("member2", 20, &team_a),
                Member::in_team("member1", 30, &team_b),
            ],
        )
        .await?;
    fx.session.flush().await?;
    fx.session.clear();

    let spec = MemberSpec::username("member1").and(MemberSpec::team_name("teamA"));
    let result = fx.members.find_all_spec(&mut fx.session, &spec).await?;
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].age, 10);

    let either = MemberSpec::team_name("teamB").or(MemberSpec::age_at_least(20));
    assert_eq!(fx.members.count_spec(&mut fx.session, &either).await?, 2);

    let page = fx
        .members
        .find_page_spec(
            &mut fx.session,
            &MemberSpec::team_name("teamA"),
            &PageRequest::of_sorted(0, 1, Sort::asc("age")),
        )
        .await?;
    assert_eq!(page.total_elements(), 2);
    assert_eq!(usernames(page.content()), vec!["member1"]);

    let one = fx
        .members
        .find_one_spec(&mut fx.session, &MemberSpec::age_at_least(30))
        .await?;
    assert_eq!(one.map(|m| m.team.key()), Some(team_b.id));
    Ok(())
}

/// Relations arrive as keys unless fetched; fetch hints and fetch joins load them.
pub async fn test_fetch_strategies<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let team_a = save_team(&mut fx, "teamA").await?;
    let team_b = save_team(&mut fx, "teamB").await?;
    fx.members
        .save(&mut fx.session, Member::in_team("member1", 10, &team_a))
        .await?;
    fx.members
        .save(&mut fx.session, Member::in_team("member2", 10, &team_b))
        .await?;
    fx.session.clear();

    let mut lazy = fx
        .members
        .find_by_username(&mut fx.session, "member1".into())
        .await?;
    assert_eq!(lazy[0].team, Ref::Key(team_a.id.ok_or(RepoError::NotFound)?));
    assert!(!lazy[0].team.is_loaded());
    let loaded = lazy[0].team.load(&fx.teams, &mut fx.session).await?;
    assert_eq!(loaded.map(|t| t.name.as_str()), Some("teamA"));

    fx.session.clear();
    let graph = fx
        .members
        .find_entity_graph_by_username(&mut fx.session, "member1".into())
        .await?;
    assert_eq!(graph[0].team.get().map(|t| t.name.as_str()), Some("teamA"));

    let joined = fx.members.find_member_fetch_join(&mut fx.session).await?;
    assert_eq!(joined.len(), 2);
    assert!(joined.iter().all(|m| m.team.is_loaded()));

    let of_b = fx
        .members
        .find_by_team_name(&mut fx.session, "teamB".into())
        .await?;
    assert_eq!(usernames(&of_b), vec!["member2"]);
    let of_a = fx
        .members
        .find_by_team_id(&mut fx.session, team_a.id.ok_or(RepoError::NotFound)?)
        .await?;
    assert_eq!(usernames(&of_a), vec!["member1"]);
    Ok(())
}

/// Read-only results are neither tracked nor written back.
pub async fn test_read_only_hint<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    fx.members
        .save(&mut fx.session, Member::with_age("member1", 10))
        .await?;
    fx.session.flush().await?;
    fx.session.clear();

    let found = fx
        .members
        .find_read_only_by_username(&mut fx.session, "member1".into())
        .await?;
    assert_eq!(fx.session.managed_count(), 0);
    let mut member = found.ok_or(RepoError::NotFound)?;
    member.username = "member2".into();
    fx.session.flush().await?;

    assert!(fx
        .members
        .find_optional_by_username(&mut fx.session, "member2".into())
        .await?
        .is_none());
    Ok(())
}

pub async fn test_projections<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let team = save_team(&mut fx, "teamA").await?;
    fx.members
        .save(&mut fx.session, Member::in_team("member1", 10, &team))
        .await?;
    fx.members
        .save(&mut fx.session, Member::with_age("member2", 20))
        .await?;
    fx.session.clear();

    let flat = fx
        .members
        .find_projections_by_username(&mut fx.session, "member1".into())
        .await?;
    assert_eq!(
        flat,
        vec![UsernameOnly {
            username: "member1".into()
        }]
    );

    let nested = fx
        .members
        .find_nested_projections_by_username(&mut fx.session, "member1".into())
        .await?;
    assert_eq!(
        nested[0].team,
        Some(TeamInfo {
            name: "teamA".into()
        })
    );
    let without_team = fx
        .members
        .find_nested_projections_by_username(&mut fx.session, "member2".into())
        .await?;
    assert_eq!(without_team.len(), 1);
    assert_eq!(without_team[0].team, None);
    assert_eq!(fx.session.managed_count(), 0);
    Ok(())
}

pub async fn test_custom_repository<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    for (name, age) in [("member1", 10), ("member2", 20), ("member3", 30)] {
        fx.members
            .save(&mut fx.session, Member::with_age(name, age))
            .await?;
    }

    assert_eq!(fx.members.find_member_custom(&mut fx.session).await?.len(), 3);

    let by_name = fx
        .members
        .search(&mut fx.session, Some("member2".into()), None)
        .await?;
    assert_eq!(usernames(&by_name), vec!["member2"]);
    let by_age = fx.members.search(&mut fx.session, None, Some(20)).await?;
    assert_eq!(usernames(&by_age), vec!["member2", "member3"]);
    let both = fx
        .members
        .search(&mut fx.session, Some("member1".into()), Some(20))
        .await?;
    assert!(both.is_empty());
    assert_eq!(fx.members.search(&mut fx.session, None, None).await?.len(), 3);
    Ok(())
}

/// Queued removals by derived delete and by `delete_all`.
pub async fn test_deletes<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    for name in ["member1", "member2", "member3"] {
        fx.members.save(&mut fx.session, Member::new(name)).await?;
    }

    let queued = fx
        .members
        .delete_by_username(&mut fx.session, "member2".into())
        .await?;
    assert_eq!(queued, 1);
    assert_eq!(fx.session.pending_delete_count(), 1);
    assert_eq!(fx.members.count(&mut fx.session).await?, 2);

    fx.members.delete_all(&mut fx.session).await?;
    fx.session.flush().await?;
    assert_eq!(fx.members.count(&mut fx.session).await?, 0);
    Ok(())
}

/// Rollback discards writes; a nested scope rolls back only its own work.
pub async fn test_transactions<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;

    fx.session.begin().await?;
    fx.members.save(&mut fx.session, Member::new("discarded")).await?;
    fx.session.rollback().await?;
    assert_eq!(fx.members.count(&mut fx.session).await?, 0);

    fx.session.begin().await?;
    fx.members.save(&mut fx.session, Member::new("kept")).await?;
    fx.session
        .begin_with(&TransactionDefinition::default().with_propagation(Propagation::Nested))
        .await?;
    fx.members.save(&mut fx.session, Member::new("nested")).await?;
    fx.session.rollback().await?;
    fx.session.commit().await?;
    let names = fx.members.find_username_list(&mut fx.session).await?;
    assert_eq!(names, vec!["kept".to_string()]);

    let members = fx.members.clone();
    let saved = TransactionTemplate::new()
        .execute(&mut fx.session, move |s| {
            Box::pin(async move { members.save(s, Member::new("templated")).await })
        })
        .await?;
    assert!(saved.id.is_some());
    assert!(!fx.session.in_transaction());
    assert_eq!(fx.members.count(&mut fx.session).await?, 2);

    fx.session.begin().await?;
    fx.members.save(&mut fx.session, Member::new("doomed")).await?;
    fx.session.set_rollback_only()?;
    fx.session.commit().await?;
    assert_eq!(fx.members.count(&mut fx.session).await?, 2);
    Ok(())
}

/// Pessimistic locks need an enclosing transaction.
pub async fn test_lock_requires_transaction<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    fx.members
        .save(&mut fx.session, Member::with_age("member1", 10))
        .await?;

    let err = fx
        .members
        .find_lock_by_username(&mut fx.session, "member1".into())
        .await
        .err();
    assert!(matches!(
        err.as_ref().map(RepoError::root_cause),
        Some(RepoError::TransactionRequired { .. })
    ));

    fx.session.begin().await?;
    let locked = fx
        .members
        .find_lock_by_username(&mut fx.session, "member1".into())
        .await?;
    assert_eq!(locked.len(), 1);
    fx.session.commit().await?;
    Ok(())
}

/// Key-only entities and the team side of the relation.
pub async fn test_items_and_teams<F: EngineFactory>(f: &F) -> RepoResult<()> {
    let mut fx = fixture(f).await?;
    let items = ItemRepository::new()?;
    let item = items.save(&mut fx.session, Item::default()).await?;
    assert!(item.id.is_some());
    // Saving again with its key merges instead of inserting.
    items.save(&mut fx.session, item.clone()).await?;
    assert_eq!(items.count(&mut fx.session).await?, 1);

    let team = save_team(&mut fx, "teamA").await?;
    let found = fx.teams.find_by_name(&mut fx.session, "teamA".into()).await?;
    assert_eq!(found, Some(team));
    assert!(fx
        .teams
        .find_by_name(&mut fx.session, "teamZ".into())
        .await?
        .is_none());
    Ok(())
}
