//! Hand-written member queries, composed into the generated member repository.

use async_trait::async_trait;
use datarepo::query::CompareOp;
use datarepo::ql::{Expect, TextQuery};
use datarepo::{
    Engine, Params, Predicate, QueryHints, RepoResult, RepositoryFragment, Session,
    SimpleRepository, Sort,
};

use crate::entity::{Member, MemberRowAdapter};

#[async_trait]
pub trait MemberRepositoryCustom<E: Engine>: Send + Sync {
    async fn find_member_custom(&self, session: &mut Session<E>) -> RepoResult<Vec<Member>>;

    /// Members matching every criterion that is present, ordered by key.
    /// With no criteria this returns every member.
    async fn search(
        &self,
        session: &mut Session<E>,
        username: Option<String>,
        min_age: Option<i32>,
    ) -> RepoResult<Vec<Member>>;
}

#[derive(Clone, Debug)]
pub struct MemberRepositoryImpl {
    members: SimpleRepository<Member, MemberRowAdapter>,
    all_members: TextQuery,
}

impl RepositoryFragment for MemberRepositoryImpl {
    fn build() -> RepoResult<Self> {
        let all_members = TextQuery::parse::<Member>("select m from Member m")?;
        all_members.expect(Expect::Entities)?;
        Ok(Self {
            members: SimpleRepository::new(MemberRowAdapter),
            all_members,
        })
    }
}

#[async_trait]
impl<E: Engine> MemberRepositoryCustom<E> for MemberRepositoryImpl {
    async fn find_member_custom(&self, session: &mut Session<E>) -> RepoResult<Vec<Member>> {
        let query = self.all_members.bind_select(&Params::new())?;
        self.members
            .find_with(session, query, &QueryHints::default(), "find_member_custom")
            .await
    }

    async fn search(
        &self,
        session: &mut Session<E>,
        username: Option<String>,
        min_age: Option<i32>,
    ) -> RepoResult<Vec<Member>> {
        let mut query = self.members.query().sorted(Sort::asc("id"));
        if let Some(username) = username {
            query = query.filter(Predicate::eq("username", username));
        }
        if let Some(age) = min_age {
            query = query.filter(Predicate::compare("age", CompareOp::Ge, age));
        }
        tracing::debug!(filtered = query.filter.is_some(), "member search");
        self.members
            .find_with(session, query, &QueryHints::default(), "search")
            .await
    }
}
