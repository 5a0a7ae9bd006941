//! Repositories for the tutorial domain.
//!
//! Every finder name and query text below is parsed when `Repository::new()` runs.

use async_trait::async_trait;
use datarepo::{repository, Engine, RepoResult, Session};

use crate::custom::{MemberRepositoryCustom, MemberRepositoryImpl};
use crate::dto::{MemberDto, NestedClosedProjection, UsernameOnly};
use crate::entity::{Item, ItemRowAdapter, Member, MemberRowAdapter, Team, TeamRowAdapter};

#[repository(
    entity = Member,
    custom = MemberRepositoryImpl,
    finders(
        find_by_username_and_age_greater_than(username: String, age: i32) -> Vec,
        find_by_username(username: String) -> Vec,
        find_list_by_username(username: String) -> Vec,
        find_member_by_username(username: String) -> Option,
        find_optional_by_username(username: String) -> Option,
        find_by_age(age: i32) -> Page,
        find_slice_by_age(age: i32) -> Slice,
        find_top3_by_age_greater_than_order_by_age_desc(age: i32) -> Vec,
        find_by_team_id(team_id: i64) -> Vec,
        find_by_team_name(name: String) -> Vec,
        find_by_username_starting_with(prefix: String) -> Vec,
        find_by_username_containing(part: String) -> Vec,
        count_by_age(age: i32) -> Count,
        exists_by_username(username: String) -> Exists,
        delete_by_username(username: String) -> Delete,
        #[hints(fetch = "team")]
        find_entity_graph_by_username(username: String) -> Vec,
        #[hints(read_only)]
        find_read_only_by_username(username: String) -> Option,
        #[hints(lock = "pessimistic_write")]
        find_lock_by_username(username: String) -> Vec,
        find_projections_by_username(username: String) -> Projected<UsernameOnly>,
        find_nested_projections_by_username(username: String) -> Projected<NestedClosedProjection>,
    ),
    queries(
        find_user(username: String, age: i32) -> Vec =
            "select m from Member m where m.username = :username and m.age = :age",
        find_username_list() -> Scalars<String> =
            "select m.username from Member m order by m.id",
        find_member_dto() -> Rows<MemberDto> =
            "select new study.dto.MemberDto(m.id, m.username, t.name) from Member m join m.team t",
        find_by_names(names: Vec<String>) -> Vec =
            "select m from Member m where m.username in :names",
        find_member_fetch_join() -> Vec =
            "select m from Member m left join fetch m.team t",
        count_older_than(age: i32) -> Count =
            "select count(m) from Member m where m.age > ?1",
        bulk_age_plus(age: i32) -> Modifying =
            "update Member m set m.age = m.age + 1 where m.age >= :age",
        #[modifying(flush_automatically, clear_automatically)]
        bulk_age_plus_and_clear(age: i32) -> Modifying =
            "update Member m set m.age = m.age + 1 where m.age >= :age",
        delete_named(names: Vec<String>) -> Modifying =
            "delete from Member m where m.username in :names",
    )
)]
pub mod member_repository {}

pub type MemberRepository = member_repository::Repository;

#[async_trait]
impl<E: Engine> MemberRepositoryCustom<E> for MemberRepository {
    async fn find_member_custom(&self, session: &mut Session<E>) -> RepoResult<Vec<Member>> {
        self.custom().find_member_custom(session).await
    }

    async fn search(
        &self,
        session: &mut Session<E>,
        username: Option<String>,
        min_age: Option<i32>,
    ) -> RepoResult<Vec<Member>> {
        self.custom().search(session, username, min_age).await
    }
}

#[repository(
    entity = Team,
    finders(
        find_by_name(name: String) -> Option,
    )
)]
pub mod team_repository {}

pub type TeamRepository = team_repository::Repository;

#[repository(entity = Item)]
pub mod item_repository {}

pub type ItemRepository = item_repository::Repository;
