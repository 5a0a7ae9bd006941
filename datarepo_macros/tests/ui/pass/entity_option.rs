use datarepo_core::{Fetchable, Identifiable, Insertable};
use datarepo_macros::Entity;

#[derive(Entity, Clone, Debug, PartialEq)]
struct Article {
    #[fetch(id)]
    id: Option<i64>,
    title: String,
    subtitle: Option<String>,
}

fn main() {
    // Pluralized table name
    assert_eq!(Article::TABLE, "articles");
    assert_eq!(Article::SELECT_COLUMNS, &["id", "title", "subtitle"]);
    assert_eq!(Article::INSERT_COLUMNS, &["title", "subtitle"]);
    let a = Article { id: None, title: "t".into(), subtitle: None };
    let a = a.with_id(5);
    let id: Option<<Article as Identifiable>::Key> = a.id();
    assert_eq!(id, Some(5));
    let _adapter = ArticleRowAdapter;
}
