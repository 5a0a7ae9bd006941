use datarepo_core::{Fetchable, Insertable, ParamValue, Record, Ref, RowAdapter};
use datarepo_macros::Entity;

#[derive(Entity, Clone, Debug)]
struct Team {
    #[fetch(id)]
    id: Option<i64>,
    name: String,
}

#[derive(Entity, Clone, Debug)]
struct Member {
    #[fetch(id)]
    id: Option<i64>,
    username: String,
    team: Ref<Team>,
}

fn main() {
    assert_eq!(Member::SELECT_COLUMNS, &["id", "username", "team_id"]);
    assert_eq!(Member::RELATIONS[0].name, "team");
    assert_eq!(Member::RELATIONS[0].table, "teams");
    let m = Member { id: None, username: "a".into(), team: Ref::Key(3) };
    assert_eq!(m.insert_values()[1], ParamValue::I64(3));

    let row = Record::new()
        .with("id", 1_i64)
        .with("username", "a")
        .with("team_id", 3_i64)
        .with("team.id", 3_i64)
        .with("team.name", "teamA");
    let loaded = MemberRowAdapter.from_row(&row).unwrap();
    assert_eq!(loaded.team.get().map(|t| t.name.as_str()), Some("teamA"));
}
