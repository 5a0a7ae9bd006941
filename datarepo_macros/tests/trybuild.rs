#[test]
#[ignore = "UI expected outputs depend on the compiler version; bless locally with TRYBUILD=overwrite"]
fn ui_compile_fail() {
    let t = trybuild::TestCases::new();
    t.compile_fail("tests/ui/fail/entity_missing_id.rs");
    t.compile_fail("tests/ui/fail/entity_duplicate_id.rs");
    t.compile_fail("tests/ui/fail/entity_invalid_meta.rs");
    t.compile_fail("tests/ui/fail/entity_unsupported_field_type.rs");
    t.compile_fail("tests/ui/fail/repository_missing_entity.rs");
    t.compile_fail("tests/ui/fail/repository_unknown_list.rs");
    t.compile_fail("tests/ui/fail/repository_unknown_nv.rs");
    t.compile_fail("tests/ui/fail/repository_unsupported_attr_format.rs");
    t.compile_fail("tests/ui/fail/repository_unknown_kind.rs");
    t.compile_fail("tests/ui/fail/repository_finder_with_text.rs");
    t.compile_fail("tests/ui/fail/repository_query_without_text.rs");
}

#[test]
#[ignore = "UI expected outputs depend on the compiler version; bless locally with TRYBUILD=overwrite"]
fn ui_pass() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/pass/entity_option.rs");
    t.pass("tests/ui/pass/entity_custom_table_and_columns.rs");
    t.pass("tests/ui/pass/entity_relation.rs");
    t.pass("tests/ui/pass/projection_nested.rs");
    t.pass("tests/ui/pass/repository_basic.rs");
}
