//! Reusable member criteria for `SpecificationExecutor` queries.

use datarepo::Specification;

use crate::entity::Member;

pub struct MemberSpec;

impl MemberSpec {
    /// Members whose team is named `team_name`. A blank name places no restriction.
    pub fn team_name(team_name: impl Into<String>) -> Specification<Member> {
        let team_name = team_name.into();
        Specification::new(move |root| {
            if team_name.trim().is_empty() {
                return Ok(None);
            }
            Ok(Some(root.join("team")?.get("name")?.eq(team_name.as_str())))
        })
    }

    pub fn username(username: impl Into<String>) -> Specification<Member> {
        let username = username.into();
        Specification::new(move |root| Ok(Some(root.get("username")?.eq(username.as_str()))))
    }

    pub fn age_at_least(age: i32) -> Specification<Member> {
        Specification::new(move |root| Ok(Some(root.get("age")?.ge(age))))
    }
}
