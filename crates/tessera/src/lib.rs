#![doc = include_str!("../../../README.md")]

pub mod ast;
pub mod bytecode;
mod diagnostics;
mod error;
mod location;
mod options;
mod parse;
mod scope;

pub use crate::{
    bytecode::{CodeUnit, JumpError},
    diagnostics::{CollectingDiagnostics, DiagnosticEvent, Diagnostics, NoDiagnostics, TracingDiagnostics},
    error::{CompileError, ErrorKind, WarningKind},
    location::{CodeLoc, CodeRange},
    options::{CompileOptions, DEFAULT_MAX_NESTING_DEPTH},
    parse::parse,
    scope::{Scope, ScopeAnalysis, ScopeKind, SymbolKind},
};

/// Compiles a module's source into its code unit.
///
/// Nested functions, classes and comprehensions are compiled into code units
/// stored in the constant pool of their parent.
///
/// # Errors
/// Returns the first syntax error, unsupported construct or exceeded limit.
pub fn compile(source: &str, options: &CompileOptions) -> Result<CodeUnit, CompileError> {
    compile_with_diagnostics(source, options, &mut NoDiagnostics)
}

/// Like [`compile`], reporting warnings and the aborting error to `diagnostics`.
///
/// # Errors
/// See [`compile`]. The error is passed to `Diagnostics::on_error` before it
/// is returned.
pub fn compile_with_diagnostics(
    source: &str,
    options: &CompileOptions,
    diagnostics: &mut dyn Diagnostics,
) -> Result<CodeUnit, CompileError> {
    let result = parse(source, options).and_then(|module| {
        let scopes = ScopeAnalysis::analyze(&module)?;
        bytecode::compile_module(&module, &scopes, options, diagnostics)
    });
    if let Err(err) = &result {
        diagnostics.on_error(err.kind(), err.range(), &err.message());
    }
    result
}
