use datarepo_core::engine::Engine;
use datarepo_core::paging::Sort;
use datarepo_core::query::{
    Assignment, BulkDelete, BulkUpdate, CompareOp, CountQuery, LockMode, Operand, Path,
    Predicate, SelectQuery, SetExpr,
};
use datarepo_core::transactions::TransactionDefinition;
use datarepo_core::{EntityMeta, ParamValue, Record, Relation, RepoError};
use datarepo_memory::{MemoryConn, MemoryEngine};

const TEAM_COLUMNS: &[&str] = &["id", "name"];
const TEAM_FINDABLE: &[(&str, &str)] = &[("name", "String")];
const RELATIONS: &[Relation] = &[Relation {
    name: "team",
    column: "team_id",
    entity: "Team",
    table: "teams",
    id_column: "id",
    columns: TEAM_COLUMNS,
    findable: TEAM_FINDABLE,
}];

fn teams() -> EntityMeta {
    EntityMeta {
        name: "Team",
        table: "teams",
        id_column: "id",
        columns: TEAM_COLUMNS,
        findable: TEAM_FINDABLE,
        relations: &[],
    }
}

fn members() -> EntityMeta {
    EntityMeta {
        name: "Member",
        table: "members",
        id_column: "id",
        columns: &["id", "username", "age", "team_id"],
        findable: &[
            ("username", "String"),
            ("age", "i32"),
            ("team_id", "Ref<Team>"),
        ],
        relations: RELATIONS,
    }
}

fn member(name: &str, age: i32, team: Option<i64>) -> Record {
    Record::new()
        .with("id", ParamValue::Null)
        .with("username", name)
        .with("age", age)
        .with("team_id", team)
}

async fn seeded() -> (MemoryEngine, MemoryConn) {
    let engine = MemoryEngine::new();
    let mut conn = engine.connect().await.unwrap();
    let team = Record::new().with("id", ParamValue::Null).with("name", "teamA");
    let team_id = engine.insert(&mut conn, &teams(), &team).await.unwrap();
    assert_eq!(team_id, ParamValue::I64(1));
    for (name, age, team) in [("member1", 10, Some(1)), ("member2", 20, Some(1)), ("member3", 30, None)] {
        engine.insert(&mut conn, &members(), &member(name, age, team)).await.unwrap();
    }
    (engine, conn)
}

fn usernames(rows: &[Record]) -> Vec<String> {
    rows.iter()
        .map(|r| r.try_get::<String>("username").unwrap())
        .collect()
}

#[tokio::test]
async fn inner_join_filter_and_sort() {
    let (engine, mut conn) = seeded().await;
    let q = SelectQuery::new(members())
        .filter(Predicate::eq("team.name", "teamA"))
        .sorted(Sort::desc("age"));
    let rows = engine.select(&mut conn, &q).await.unwrap();
    assert_eq!(usernames(&rows), vec!["member2", "member1"]);
}

#[tokio::test]
async fn fetch_join_keeps_rows_without_relation() {
    let (engine, mut conn) = seeded().await;
    let q = SelectQuery::new(members()).fetch("team").sorted(Sort::asc("username"));
    let rows = engine.select(&mut conn, &q).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get("team.name"), Some(&ParamValue::from("teamA")));
    assert_eq!(rows[2].get("team.name"), Some(&ParamValue::Null));
}

#[tokio::test]
async fn paging_distinct_and_count() {
    let (engine, mut conn) = seeded().await;
    let page = SelectQuery::new(members()).sorted(Sort::asc("age")).offset(1).limit(1);
    let rows = engine.select(&mut conn, &page).await.unwrap();
    assert_eq!(usernames(&rows), vec!["member2"]);

    let teams_of_members = SelectQuery::new(members())
        .columns(vec![Path::column("team_id")])
        .distinct();
    assert_eq!(engine.select(&mut conn, &teams_of_members).await.unwrap().len(), 2);

    let mut cq = CountQuery::new(members());
    cq.filter = Some(Predicate::compare("age", CompareOp::Ge, 20));
    assert_eq!(engine.count(&mut conn, &cq).await.unwrap(), 2);
}

#[tokio::test]
async fn bulk_update_adds_and_reports_rows() {
    let (engine, mut conn) = seeded().await;
    let stmt = BulkUpdate {
        entity: members(),
        assignments: vec![Assignment {
            column: "age".into(),
            value: SetExpr::Add("age".into(), Operand::Value(ParamValue::I32(1))),
        }],
        filter: Some(Predicate::compare("age", CompareOp::Ge, 20)),
    };
    assert_eq!(engine.bulk_update(&mut conn, &stmt).await.unwrap(), 2);
    let rows = engine
        .select(&mut conn, &SelectQuery::new(members()).sorted(Sort::asc("age")))
        .await
        .unwrap();
    let ages: Vec<i32> = rows.iter().map(|r| r.try_get("age").unwrap()).collect();
    assert_eq!(ages, vec![10, 21, 31]);
}

#[tokio::test]
async fn rollback_and_savepoints_restore_rows() {
    let (engine, mut conn) = seeded().await;
    engine.begin(&mut conn, &TransactionDefinition::default()).await.unwrap();
    engine.insert(&mut conn, &members(), &member("m4", 40, None)).await.unwrap();
    engine.savepoint(&mut conn, "sp1").await.unwrap();
    let all = BulkDelete {
        entity: members(),
        filter: None,
    };
    assert_eq!(engine.bulk_delete(&mut conn, &all).await.unwrap(), 4);
    engine.rollback_to_savepoint(&mut conn, "sp1").await.unwrap();
    assert_eq!(engine.row_count("members"), 4);
    engine.rollback(&mut conn).await.unwrap();
    assert_eq!(engine.row_count("members"), 3);

    // Generated keys are reused after rollback, like a fresh sequence.
    let key = engine.insert(&mut conn, &members(), &member("m5", 1, None)).await.unwrap();
    assert_eq!(key, ParamValue::I64(4));
}

#[tokio::test]
async fn dropping_connection_rolls_back() {
    let (engine, _conn) = seeded().await;
    {
        let mut other = engine.connect().await.unwrap();
        engine.begin(&mut other, &TransactionDefinition::default()).await.unwrap();
        engine
            .delete(&mut other, &members(), &ParamValue::I64(1))
            .await
            .unwrap();
        assert_eq!(engine.row_count("members"), 2);
    }
    assert_eq!(engine.row_count("members"), 3);
    assert_eq!(engine.locked_rows(), 0);
}

#[tokio::test]
async fn write_lock_blocks_other_connections() {
    let (engine, mut a) = seeded().await;
    let mut b = engine.connect().await.unwrap();
    engine.begin(&mut a, &TransactionDefinition::default()).await.unwrap();
    let locked = SelectQuery::new(members())
        .filter(Predicate::eq("username", "member1"))
        .lock(LockMode::PessimisticWrite);
    assert_eq!(engine.select(&mut a, &locked).await.unwrap().len(), 1);

    let update = Record::new().with("age", 99);
    let err = engine
        .update(&mut b, &members(), &ParamValue::I64(1), &update)
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::LockUnavailable { .. }));

    engine.begin(&mut b, &TransactionDefinition::default()).await.unwrap();
    let shared = SelectQuery::new(members()).lock(LockMode::PessimisticRead);
    assert!(engine.select(&mut b, &shared).await.unwrap_err().is_lock_unavailable());

    engine.commit(&mut a).await.unwrap();
    assert_eq!(
        engine.update(&mut b, &members(), &ParamValue::I64(1), &update).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn read_locks_share() {
    let (engine, mut a) = seeded().await;
    let mut b = engine.connect().await.unwrap();
    let def = TransactionDefinition::default();
    engine.begin(&mut a, &def).await.unwrap();
    engine.begin(&mut b, &def).await.unwrap();
    let shared = SelectQuery::new(members()).lock(LockMode::PessimisticRead);
    assert_eq!(engine.select(&mut a, &shared).await.unwrap().len(), 3);
    assert_eq!(engine.select(&mut b, &shared).await.unwrap().len(), 3);
    let exclusive = SelectQuery::new(members()).lock(LockMode::PessimisticWrite);
    assert!(engine.select(&mut b, &exclusive).await.is_err());
}

#[tokio::test]
async fn lock_without_transaction_is_rejected() {
    let (engine, mut conn) = seeded().await;
    let q = SelectQuery::new(members()).lock(LockMode::PessimisticWrite);
    assert!(matches!(
        engine.select(&mut conn, &q).await,
        Err(RepoError::TransactionRequired { .. })
    ));
}

#[tokio::test]
async fn read_only_transaction_rejects_writes() {
    let (engine, mut conn) = seeded().await;
    engine
        .begin(&mut conn, &TransactionDefinition::default().read_only())
        .await
        .unwrap();
    let err = engine
        .insert(&mut conn, &members(), &member("x", 1, None))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Backend { .. }));
    assert_eq!(engine.select(&mut conn, &SelectQuery::new(members())).await.unwrap().len(), 3);
}

#[tokio::test]
async fn duplicate_explicit_key_fails() {
    let (engine, mut conn) = seeded().await;
    let dup = member("dup", 1, None).with("id", 1_i64);
    assert!(engine.insert(&mut conn, &members(), &dup).await.is_err());
}
