use datarepo::{Entity, Fetchable, Identifiable, Insertable, Ref, Updatable};

#[derive(Entity, Clone, Debug)]
struct Team {
    #[fetch(id)]
    id: Option<i64>,
    name: String,
}

#[derive(Entity, Clone, Debug)]
struct User {
    #[fetch(id)]
    id: Option<i64>,
    email: String,
    team: Ref<Team>,
}

#[test]
fn facade_reexports_and_entity_metadata() {
    // Access associated constants via Fetchable (re-exported from datarepo_core)
    assert_eq!(User::ENTITY_NAME, "User");
    assert_eq!(User::TABLE, "users");
    assert_eq!(User::SELECT_COLUMNS, &["id", "email", "team_id"]);
    assert_eq!(User::ID_COLUMN, "id");
    assert_eq!(User::INSERT_COLUMNS, &["email", "team_id"]);
    assert_eq!(User::UPDATE_COLUMNS, User::INSERT_COLUMNS);
    assert_eq!(User::RELATIONS.len(), 1);
    assert_eq!(User::RELATIONS[0].entity, "Team");

    // Ensure the macro generated a RowAdapter type with the expected name in the consumer crate.
    let _adapter = UserRowAdapter;
    let _team_adapter = TeamRowAdapter;
}

#[test]
fn with_id_fills_the_key() {
    let team = Team {
        id: None,
        name: "teamA".into(),
    }
    .with_id(9);
    assert_eq!(team.id(), Some(9));
}
