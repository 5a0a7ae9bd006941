#![cfg(feature = "libsql-backend")]

use datarepo_core::derived::DerivedQuery;
use datarepo_core::engine::Engine;
use datarepo_core::paging::Sort;
use datarepo_core::ql::TextQuery;
use datarepo_core::query::{LockMode, Params, Predicate, SelectQuery};
use datarepo_core::session::Session;
use datarepo_core::transactions::{Isolation, TransactionDefinition};
use datarepo_core::{EntityMeta, ParamValue, Record, RepoError, RowAdapter};
use datarepo_libsql::{LibsqlConfig, LibsqlEngine};

#[derive(datarepo_macros::Entity, Clone, Debug, PartialEq)]
struct Team {
    #[fetch(id)]
    id: Option<i64>,
    name: String,
}

#[derive(datarepo_macros::Entity, Clone, Debug)]
struct Member {
    #[fetch(id)]
    id: Option<i64>,
    username: String,
    age: i32,
    team: datarepo_core::Ref<Team>,
}

const SCHEMA: &str = "
CREATE TABLE teams (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);
CREATE TABLE members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    age INTEGER NOT NULL,
    team_id INTEGER REFERENCES teams(id)
);
";

async fn engine() -> (tempfile::TempDir, LibsqlEngine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("engine.sqlite3");
    let engine = LibsqlEngine::open(LibsqlConfig::new(path.to_string_lossy()))
        .await
        .expect("open");
    engine.execute_batch(SCHEMA).await.expect("schema");
    (dir, engine)
}

fn member(name: &str, age: i32, team: Option<i64>) -> Record {
    Record::new()
        .with("id", ParamValue::Null)
        .with("username", name)
        .with("age", age)
        .with("team_id", team)
}

async fn seeded() -> (tempfile::TempDir, LibsqlEngine) {
    let (dir, engine) = engine().await;
    let mut conn = engine.connect().await.unwrap();
    let team = Record::new().with("id", ParamValue::Null).with("name", "teamA");
    let key = engine
        .insert(&mut conn, &EntityMeta::of::<Team>(), &team)
        .await
        .unwrap();
    assert_eq!(key, ParamValue::I64(1));
    let members = EntityMeta::of::<Member>();
    for (name, age, team) in [("member1", 10, Some(1)), ("member2", 20, Some(1)), ("member3", 30, None)] {
        engine.insert(&mut conn, &members, &member(name, age, team)).await.unwrap();
    }
    (dir, engine)
}

#[tokio::test]
async fn derived_query_with_join_and_fetch() {
    let (_dir, engine) = seeded().await;
    let mut conn = engine.connect().await.unwrap();
    let q = DerivedQuery::parse::<Member>("find_by_team_name_order_by_age_desc")
        .unwrap()
        .bind(vec!["teamA".into()])
        .unwrap()
        .fetch("team");
    let rows = engine.select(&mut conn, &q).await.unwrap();
    assert_eq!(rows.len(), 2);
    let first = MemberRowAdapter.from_row(&rows[0]).unwrap();
    assert_eq!(first.username, "member2");
    assert_eq!(first.team.get().map(|t| t.name.clone()), Some("teamA".to_string()));
}

#[tokio::test]
async fn text_query_count_and_bulk_update() {
    let (_dir, engine) = seeded().await;
    let mut conn = engine.connect().await.unwrap();
    let meta = EntityMeta::of::<Member>();

    let older = TextQuery::parse_with(meta, "select count(m) from Member m where m.age >= :age").unwrap();
    let params = Params::new().bind("age", 20);
    assert_eq!(engine.count(&mut conn, &older.bind_count(&params).unwrap()).await.unwrap(), 2);

    let bump = TextQuery::parse_with(meta, "update Member m set m.age = m.age + 1 where m.age >= :age").unwrap();
    let stmt = bump.bind_update(&params).unwrap();
    assert_eq!(engine.bulk_update(&mut conn, &stmt).await.unwrap(), 2);

    let ages = SelectQuery::new(meta).sorted(Sort::asc("age"));
    let rows = engine.select(&mut conn, &ages).await.unwrap();
    let ages: Vec<i32> = rows.iter().map(|r| r.try_get("age").unwrap()).collect();
    assert_eq!(ages, vec![10, 21, 31]);
}

#[tokio::test]
async fn session_rollback_discards_writes() {
    let (_dir, engine) = seeded().await;
    let meta = EntityMeta::of::<Member>();
    let mut session = Session::open(&engine).await.unwrap();
    session.begin().await.unwrap();
    session.insert(&meta, &member("member4", 40, None)).await.unwrap();
    assert_eq!(
        session.count(&SelectQuery::new(meta).to_count()).await.unwrap(),
        4
    );
    session.rollback().await.unwrap();
    assert_eq!(
        session.count(&SelectQuery::new(meta).to_count()).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn savepoints_undo_nested_work() {
    let (_dir, engine) = seeded().await;
    let meta = EntityMeta::of::<Member>();
    let mut conn = engine.connect().await.unwrap();
    engine
        .begin(&mut conn, &TransactionDefinition { isolation: Isolation::Serializable, ..Default::default() })
        .await
        .unwrap();
    engine.savepoint(&mut conn, "sp1").await.unwrap();
    engine.delete(&mut conn, &meta, &ParamValue::I64(1)).await.unwrap();
    engine.rollback_to_savepoint(&mut conn, "sp1").await.unwrap();
    engine.release_savepoint(&mut conn, "sp1").await.unwrap();
    engine.commit(&mut conn).await.unwrap();
    assert_eq!(engine.count(&mut conn, &SelectQuery::new(meta).to_count()).await.unwrap(), 3);
}

#[tokio::test]
async fn read_only_transaction_rejects_writes() {
    let (_dir, engine) = seeded().await;
    let meta = EntityMeta::of::<Member>();
    let mut conn = engine.connect().await.unwrap();
    engine
        .begin(&mut conn, &TransactionDefinition::default().read_only())
        .await
        .unwrap();
    let err = engine.insert(&mut conn, &meta, &member("x", 1, None)).await.unwrap_err();
    assert!(matches!(err, RepoError::Backend { .. }));
    engine.rollback(&mut conn).await.unwrap();
    // query_only is switched back off after the transaction
    engine.insert(&mut conn, &meta, &member("x", 1, None)).await.unwrap();
}

#[tokio::test]
async fn lock_hint_needs_a_transaction() {
    let (_dir, engine) = seeded().await;
    let meta = EntityMeta::of::<Member>();
    let mut conn = engine.connect().await.unwrap();
    let locked = SelectQuery::new(meta)
        .filter(Predicate::eq("username", "member1"))
        .lock(LockMode::PessimisticWrite);
    assert!(matches!(
        engine.select(&mut conn, &locked).await,
        Err(RepoError::TransactionRequired { .. })
    ));
    engine.begin(&mut conn, &TransactionDefinition::default()).await.unwrap();
    assert_eq!(engine.select(&mut conn, &locked).await.unwrap().len(), 1);
    engine.commit(&mut conn).await.unwrap();
}
