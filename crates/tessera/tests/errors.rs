//! Tests for compile errors and diagnostic callbacks.

use pretty_assertions::assert_eq;
use tessera::{
    CodeLoc, CollectingDiagnostics, CompileError, CompileOptions, DiagnosticEvent, ErrorKind, WarningKind, compile,
    compile_with_diagnostics,
};

fn compile_err(source: &str) -> CompileError {
    compile(source, &CompileOptions::new()).expect_err("expected a compile error")
}

// === Syntax errors ===

#[test]
fn return_outside_function() {
    let err = compile_err("x = 1\nreturn x\n");
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.message(), "'return' outside function");
    assert_eq!(err.range().start, CodeLoc::new(2, 0));
}

#[test]
fn break_outside_loop() {
    let err = compile_err("if x:\n    break\n");
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.message(), "'break' outside loop");
    assert_eq!(err.range().start.line, 2);
}

#[test]
fn continue_in_function_body_outside_loop() {
    let err = compile_err("for x in y:\n    def f():\n        continue\n");
    assert_eq!(err.message(), "'continue' not properly in loop");
}

#[test]
fn bare_except_must_be_last() {
    let err = compile_err("try:\n    pass\nexcept:\n    pass\nexcept ValueError:\n    pass\n");
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.range().start.line, 3);
}

#[test]
fn parameter_declared_global() {
    let err = compile_err("def f(x):\n    global x\n");
    assert_eq!(err.message(), "name 'x' is parameter and global");
}

#[test]
fn multiple_starred_targets() {
    let err = compile_err("*a, *b = c\n");
    assert_eq!(err.kind(), ErrorKind::Syntax);
}

fn star_unpack_with_trailing(count: usize) -> String {
    let trailing: Vec<String> = (0..count).map(|i| format!("c{i}")).collect();
    format!("a, *b, {} = x\n", trailing.join(", "))
}

/// The count of targets after the star must fit in a signed byte.
#[test]
fn too_many_targets_after_star() {
    let err = compile_err(&star_unpack_with_trailing(128));
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert_eq!(err.message(), "too many expressions in star-unpacking assignment");

    assert!(compile(&star_unpack_with_trailing(127), &CompileOptions::new()).is_ok());
}

#[test]
fn invalid_source_is_a_syntax_error() {
    let err = compile_err("def f(:\n");
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(err.to_string().starts_with("SyntaxError: "), "{err}");
}

// === Unsupported constructs ===

#[test]
fn unsupported_constructs_are_named() {
    let cases = [
        ("match x:\n    case 1:\n        pass\n", "match statement is not supported"),
        ("def f():\n    yield 1\n", "yield expression is not supported"),
        ("async def f():\n    pass\n", "async def is not supported"),
        ("x = f'{y}'\n", "f-string is not supported"),
        ("x: int = 1\n", "annotated assignment is not supported"),
    ];
    for (source, message) in cases {
        let err = compile_err(source);
        assert_eq!(err.kind(), ErrorKind::NotSupported, "{source:?}");
        assert_eq!(err.message(), message, "{source:?}");
    }
}

// === Resource limits ===

#[test]
fn deep_nesting_is_a_resource_limit() {
    let source = format!("x = {}1{}\n", "[".repeat(30), "]".repeat(30));
    let options = CompileOptions::new().max_nesting_depth(10);
    let err = compile(&source, &options).expect_err("nesting exceeds the limit");
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);

    let shallow = format!("x = {}1{}\n", "[".repeat(5), "]".repeat(5));
    assert!(compile(&shallow, &options).is_ok());
}

// === Diagnostics ===

#[test]
fn errors_are_reported_to_diagnostics() {
    let mut diagnostics = CollectingDiagnostics::new();
    let err = compile_with_diagnostics("break\n", &CompileOptions::new(), &mut diagnostics).unwrap_err();
    assert_eq!(
        diagnostics.events(),
        &[DiagnosticEvent::Error {
            kind: ErrorKind::Syntax,
            range: err.range(),
            msg: "'break' outside loop".to_owned(),
        }]
    );
}

#[test]
fn parenthesized_assert_warns() {
    let mut diagnostics = CollectingDiagnostics::new();
    let result = compile_with_diagnostics("assert (x, 'msg')\n", &CompileOptions::new(), &mut diagnostics);
    assert!(result.is_ok());
    assert_eq!(
        diagnostics.warnings().collect::<Vec<_>>(),
        vec!["assertion is always true, perhaps remove parentheses?"]
    );
    assert!(matches!(
        diagnostics.events()[0],
        DiagnosticEvent::Warning {
            kind: WarningKind::Syntax,
            ..
        }
    ));
}

#[test]
fn successful_compile_reports_nothing() {
    let mut diagnostics = CollectingDiagnostics::new();
    compile_with_diagnostics("x = 1\n", &CompileOptions::new(), &mut diagnostics).unwrap();
    assert!(diagnostics.events().is_empty());
}
