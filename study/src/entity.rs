//! The tutorial domain: members belong to at most one team.

use datarepo::{Entity, Ref};

#[derive(Entity, Clone, Debug, PartialEq)]
pub struct Team {
    #[fetch(id)]
    pub id: Option<i64>,
    pub name: String,
}

impl Team {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

/// A member and its many-to-one team reference, stored as `team_id`.
///
/// Members of a team are read through a query on this side
/// (`member_repository::Repository::find_by_team_id`); a team does not hold them.
#[derive(Entity, Clone, Debug, PartialEq)]
pub struct Member {
    #[fetch(id)]
    pub id: Option<i64>,
    pub username: String,
    pub age: i32,
    pub team: Ref<Team>,
}

impl Member {
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_age(username, 0)
    }

    pub fn with_age(username: impl Into<String>, age: i32) -> Self {
        Self {
            id: None,
            username: username.into(),
            age,
            team: Ref::Null,
        }
    }

    /// A member of `team`, which must already be saved.
    pub fn in_team(username: impl Into<String>, age: i32, team: &Team) -> Self {
        Self {
            team: Ref::to(team),
            ..Self::with_age(username, age)
        }
    }

    pub fn change_team(&mut self, team: &Team) {
        self.team = Ref::to(team);
    }
}

/// An entity with nothing but a generated key.
#[derive(Entity, Clone, Debug, PartialEq, Default)]
pub struct Item {
    #[fetch(id)]
    pub id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use datarepo::{Fetchable, Identifiable, Insertable, RowAdapter};
    use datarepo_core::{ParamValue, Record};

    #[test]
    fn member_metadata() {
        assert_eq!(Member::TABLE, "members");
        assert_eq!(Member::SELECT_COLUMNS, &["id", "username", "age", "team_id"]);
        assert_eq!(Member::ID_COLUMN, "id");
        assert_eq!(Member::RELATIONS.len(), 1);
        assert_eq!(Member::RELATIONS[0].name, "team");
        assert_eq!(Member::RELATIONS[0].table, "teams");
    }

    #[test]
    fn item_has_only_a_key() {
        assert_eq!(Item::TABLE, "items");
        assert_eq!(Item::SELECT_COLUMNS, &["id"]);
        assert!(Item::INSERT_COLUMNS.is_empty());
        assert!(Item::default().insert_values().is_empty());
    }

    #[test]
    fn in_team_writes_the_team_key() {
        let team = Team::new("teamA").with_id(7);
        let member = Member::in_team("member1", 10, &team);
        assert_eq!(member.team.key(), Some(7));
        assert_eq!(
            member.insert_values(),
            vec![
                ParamValue::String("member1".into()),
                ParamValue::I32(10),
                ParamValue::I64(7)
            ]
        );
    }

    #[test]
    fn adapter_reads_a_key_only_reference() {
        let row = Record::new()
            .with("id", 1_i64)
            .with("username", "member1")
            .with("age", 10)
            .with("team_id", 3_i64);
        let member = MemberRowAdapter.from_row(&row).unwrap();
        assert_eq!(member.team, Ref::Key(3));
        assert!(!member.team.is_loaded());
    }
}
