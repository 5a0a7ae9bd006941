// Criterion benches for engine operations using libsql (SQLite) on a temporary file.
// Run locally with:
//   cargo bench -p datarepo_libsql --features libsql-backend --bench ops

#[cfg(feature = "libsql-backend")]
mod bench_impl {
    use criterion::{black_box, Criterion};
    use datarepo_core::engine::Engine;
    use datarepo_core::paging::Sort;
    use datarepo_core::query::{CompareOp, Predicate, SelectQuery};
    use datarepo_core::{EntityMeta, ParamValue, Record};
    use datarepo_libsql::{LibsqlConfig, LibsqlEngine};

    fn users() -> EntityMeta {
        EntityMeta {
            name: "User",
            table: "users",
            id_column: "id",
            columns: &["id", "email", "age"],
            findable: &[("email", "String"), ("age", "i32")],
            relations: &[],
        }
    }

    fn user(i: i64) -> Record {
        Record::new()
            .with("id", ParamValue::Null)
            .with("email", format!("u{i}@x"))
            .with("age", i % 90)
    }

    fn setup(rt: &tokio::runtime::Runtime) -> (tempfile::TempDir, LibsqlEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bench.sqlite3");
        let engine = rt.block_on(async {
            let engine = LibsqlEngine::open(LibsqlConfig::new(path.to_string_lossy()))
                .await
                .expect("open");
            engine
                .execute_batch(
                    "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT NOT NULL, age INTEGER NOT NULL);",
                )
                .await
                .expect("apply schema");
            engine
        });
        (dir, engine)
    }

    pub fn bench_insert(c: &mut Criterion) {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let (_dir, engine) = setup(&rt);
        let mut conn = rt.block_on(engine.connect()).expect("connect");
        let mut i = 0_i64;
        let mut group = c.benchmark_group("libsql_insert");
        group.bench_function("insert_one", |b| {
            b.iter(|| {
                i += 1;
                rt.block_on(async {
                    black_box(engine.insert(&mut conn, &users(), &user(i)).await.expect("insert"))
                })
            })
        });
        group.finish();
    }

    pub fn bench_select(c: &mut Criterion) {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let (_dir, engine) = setup(&rt);
        let mut conn = rt.block_on(engine.connect()).expect("connect");
        rt.block_on(async {
            for i in 0..1_000 {
                engine.insert(&mut conn, &users(), &user(i)).await.expect("seed");
            }
        });
        let query = SelectQuery::new(users())
            .filter(Predicate::compare("age", CompareOp::Gt, 45))
            .sorted(Sort::desc("email"))
            .limit(20);
        let mut group = c.benchmark_group("libsql_select");
        group.bench_function("filter_sort_limit_1000", |b| {
            b.iter(|| rt.block_on(async { black_box(engine.select(&mut conn, &query).await.expect("select")) }))
        });
        group.finish();
    }
}

#[cfg(feature = "libsql-backend")]
criterion::criterion_group!(benches, bench_impl::bench_insert, bench_impl::bench_select);
#[cfg(feature = "libsql-backend")]
criterion::criterion_main!(benches);

#[cfg(not(feature = "libsql-backend"))]
fn main() {
    eprintln!("Enable feature libsql-backend to run this bench");
}
