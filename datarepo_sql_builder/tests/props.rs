use datarepo_core::query::{CompareOp, Operand, Path, Predicate, SelectQuery};
use datarepo_core::{EntityMeta, ParamValue};
use datarepo_sql_builder::{Placeholder, SqlBuilder};
use proptest::prelude::*;

fn people() -> EntityMeta {
    EntityMeta {
        name: "Person",
        table: "people_props",
        id_column: "id",
        columns: &["id", "email_address", "age"],
        findable: &[("email_address", "String"), ("age", "i64")],
        relations: &[],
    }
}

fn leaf() -> impl Strategy<Value = Predicate> {
    prop_oneof![
        (any::<i64>(), 0usize..6).prop_map(|(v, op)| {
            let op = [
                CompareOp::Eq,
                CompareOp::Ne,
                CompareOp::Gt,
                CompareOp::Ge,
                CompareOp::Lt,
                CompareOp::Le,
            ][op];
            Predicate::compare("age", op, v)
        }),
        proptest::collection::vec(any::<i64>(), 0..5).prop_map(|vs| Predicate::In {
            path: Path::column("age"),
            values: Operand::Value(ParamValue::from(vs)),
            negated: false,
        }),
        "[a-z]{0,6}".prop_map(|s| Predicate::eq("email_address", s)),
        (any::<i64>(), any::<i64>()).prop_map(|(a, b)| Predicate::Between {
            path: Path::column("age"),
            low: Operand::Value(a.into()),
            high: Operand::Value(b.into()),
        }),
        any::<bool>().prop_map(|negated| Predicate::Null {
            path: Path::column("email_address"),
            negated,
        }),
    ]
}

fn predicate() -> impl Strategy<Value = Predicate> {
    leaf().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 1..4).prop_map(Predicate::And),
            proptest::collection::vec(inner.clone(), 1..4).prop_map(Predicate::Or),
            inner.prop_map(Predicate::not),
        ]
    })
}

proptest! {
    // Property: one `?` per parameter, in any predicate tree.
    #[test]
    fn question_placeholders_match_params(p in predicate()) {
        let (sql, params) = SqlBuilder::new(Placeholder::Question)
            .select(&SelectQuery::new(people()).filter(p))
            .unwrap();
        prop_assert_eq!(sql.matches('?').count(), params.len());
    }

    // Property: `$n` numbering is continuous from 1.
    #[test]
    fn dollar_placeholders_are_numbered(p in predicate()) {
        let (sql, params) = SqlBuilder::new(Placeholder::Dollar)
            .select(&SelectQuery::new(people()).filter(p))
            .unwrap();
        for i in 1..=params.len() {
            let needle = format!("${}", i);
            prop_assert!(sql.contains(&needle));
        }
        let next = format!("${}", params.len() + 1);
        prop_assert!(!sql.contains(&next));
    }

    // Property: parentheses always balance.
    #[test]
    fn parentheses_balance(p in predicate()) {
        let (sql, _) = SqlBuilder::default()
            .select(&SelectQuery::new(people()).filter(p))
            .unwrap();
        prop_assert_eq!(sql.matches('(').count(), sql.matches(')').count());
    }
}
