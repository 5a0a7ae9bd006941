use datarepo_core::{Fetchable, Identifiable, Record, RowAdapter};
use datarepo_macros::Entity;

#[derive(Entity, Clone, Debug, PartialEq)]
#[entity(table = "people")]
struct Person {
    #[fetch(id, column = "person_id")]
    id: i64,
    #[fetch(column = "full_name")]
    name: String,
    #[fetch(skip)]
    scratch: Vec<u8>,
}

fn main() {
    assert_eq!(Person::TABLE, "people");
    assert_eq!(Person::ID_COLUMN, "person_id");
    assert_eq!(Person::SELECT_COLUMNS, &["person_id", "full_name"]);
    assert_eq!(Person::FINDABLE_COLUMNS, &[("full_name", "String")]);
    let row = Record::new().with("person_id", 7_i64).with("full_name", "Ada");
    let p = PersonRowAdapter.from_row(&row).unwrap();
    assert_eq!(p, Person { id: 7, name: "Ada".into(), scratch: Vec::new() });
}
