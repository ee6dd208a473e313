#[test]
fn validate_macro_tests() {
    let t = trybuild::TestCases::new();

    t.pass("tests/ok/basic_valid.rs");
    t.pass("tests/ok/struct_rules.rs");
    t.pass("tests/ok/skip_field.rs");
    t.pass("tests/ok/custom_error.rs");
}
