use datarepo_core::projection::{FromRecord, Projection};
use datarepo_core::{ParamValue, Record};
use datarepo_macros::Projection;

#[derive(Projection, Debug)]
struct TeamInfo {
    name: String,
}

#[derive(Projection, Debug)]
struct MemberView {
    username: String,
    #[projection(nested)]
    team: Option<TeamInfo>,
}

fn main() {
    let cols: Vec<String> = MemberView::columns().iter().map(|p| p.to_string()).collect();
    assert_eq!(cols, vec!["username", "team.name"]);
    assert_eq!(MemberView::optional_relations(), vec!["team".to_string()]);

    let row = Record::new().with("username", "m1").with("team.name", ParamValue::Null);
    let view = MemberView::from_record(&row).unwrap();
    assert!(view.team.is_none());
}
