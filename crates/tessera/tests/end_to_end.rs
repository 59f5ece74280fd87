//! End-to-end compilation tests: source in, code units out.
//!
//! These check the exact instruction streams and metadata produced for small
//! programs, the way a runtime would consume them.

use pretty_assertions::assert_eq;
use tessera::{
    CodeUnit, CompileOptions,
    bytecode::{BinaryOp, CodeFlags, Constant, MakeFunctionFlags, Opcode, UnitKind},
    compile,
};

fn compile_ok(source: &str) -> CodeUnit {
    compile(source, &CompileOptions::new()).unwrap_or_else(|err| panic!("failed to compile {source:?}: {err}"))
}

/// Opcodes and immediates of every instruction, `ExtendedArg` prefixes included.
fn listing(code: &CodeUnit) -> Vec<(Opcode, i32)> {
    code.instructions().map(|instr| (instr.opcode, instr.arg)).collect()
}

fn nested<'a>(code: &'a CodeUnit, name: &str) -> &'a CodeUnit {
    code.nested_units()
        .find(|unit| unit.name == name)
        .unwrap_or_else(|| panic!("no nested unit named {name}"))
}

// === Functions ===

#[test]
fn add_one_function() {
    let module = compile_ok("def f(x):\n    return x + 1\n");
    let f = nested(&module, "f");

    assert_eq!(
        listing(f),
        vec![
            (Opcode::LoadFast, 0),
            (Opcode::LoadByte, 1),
            (Opcode::BinaryOp, BinaryOp::Add as i32),
            (Opcode::ReturnValue, 0),
        ]
    );
    assert_eq!(f.kind, UnitKind::Function);
    assert_eq!(f.qualname, "f");
    assert_eq!(f.argcount, 1);
    assert_eq!(f.varnames, vec!["x".to_owned()]);
    assert!(f.cellvars.is_empty());
    assert!(f.freevars.is_empty());
    assert_eq!(f.stack_size, 2);
    assert_eq!(f.flags & CodeFlags::NOFREE, CodeFlags::NOFREE);
    // slot 0 is the docstring
    assert_eq!(f.constants, vec![Constant::None]);
}

#[test]
fn module_binds_function_and_returns_none() {
    let module = compile_ok("def f(x):\n    return x + 1\n");
    let opcodes: Vec<Opcode> = module.instructions().map(|instr| instr.opcode).collect();
    assert_eq!(
        opcodes,
        vec![Opcode::MakeFunction, Opcode::StoreName, Opcode::LoadNone, Opcode::ReturnValue]
    );
    assert_eq!(module.kind, UnitKind::Module);
    assert_eq!(module.names, vec!["f".to_owned()]);
    assert_eq!(module.stack_size, 1);
}

#[test]
fn docstring_is_first_constant() {
    let module = compile_ok("def f():\n    \"adds nothing\"\n    return 0\n");
    let f = nested(&module, "f");
    assert_eq!(f.constants[0], Constant::Str("adds nothing".to_owned()));
}

#[test]
fn defaults_set_make_function_flag() {
    let module = compile_ok("def f(a, b=2, *, c=3):\n    return a\n");
    let make = module
        .instructions()
        .find(|instr| instr.opcode == Opcode::MakeFunction)
        .expect("module makes a function");
    assert_eq!(
        make.following[0],
        MakeFunctionFlags::HAS_DEFAULTS | MakeFunctionFlags::HAS_KWONLY_DEFAULTS
    );
    let f = nested(&module, "f");
    assert_eq!(f.argcount, 2);
    assert_eq!(f.kwonlyargcount, 1);
}

#[test]
fn varargs_set_code_flags() {
    let module = compile_ok("def f(*args, **kwargs):\n    return args\n");
    let f = nested(&module, "f");
    assert_eq!(f.flags & CodeFlags::VARARGS, CodeFlags::VARARGS);
    assert_eq!(f.flags & CodeFlags::VARKEYWORDS, CodeFlags::VARKEYWORDS);
    assert_eq!(f.varnames, vec!["args".to_owned(), "kwargs".to_owned()]);
}

// === Closures ===

#[test]
fn closure_captures_cell() {
    let source = "\
def outer():
    x = 1
    def inner():
        return x
    return inner
";
    let module = compile_ok(source);
    let outer = nested(&module, "outer");
    let inner = nested(outer, "inner");

    assert_eq!(outer.cellvars, vec!["x".to_owned()]);
    assert_eq!(inner.freevars, vec!["x".to_owned()]);
    assert_eq!(inner.qualname, "outer.<locals>.inner");
    assert_eq!(inner.flags & CodeFlags::NESTED, CodeFlags::NESTED);
    assert_eq!(outer.flags & CodeFlags::NOFREE, 0);
    assert_eq!(inner.flags & CodeFlags::NOFREE, 0);

    let opcodes: Vec<Opcode> = outer.instructions().map(|instr| instr.opcode).collect();
    assert!(opcodes.contains(&Opcode::StoreDeref), "{opcodes:?}");
    assert!(opcodes.contains(&Opcode::LoadClosure), "{opcodes:?}");
    assert!(opcodes.contains(&Opcode::ClosureFromStack), "{opcodes:?}");
    let make = outer
        .instructions()
        .find(|instr| instr.opcode == Opcode::MakeFunction)
        .expect("outer makes inner");
    assert_eq!(make.following[0], MakeFunctionFlags::HAS_CLOSURE);

    assert_eq!(
        listing(inner),
        vec![(Opcode::LoadDeref, 0), (Opcode::ReturnValue, 0)]
    );
}

#[test]
fn global_declaration_uses_global_ops() {
    let module = compile_ok("def f():\n    global g\n    g = 1\n");
    let f = nested(&module, "f");
    let opcodes: Vec<Opcode> = f.instructions().map(|instr| instr.opcode).collect();
    assert_eq!(
        opcodes,
        vec![Opcode::LoadByte, Opcode::StoreGlobal, Opcode::LoadNone, Opcode::ReturnValue]
    );
    assert_eq!(f.names, vec!["g".to_owned()]);
}

// === Classes ===

#[test]
fn class_body_stores_module_and_qualname() {
    let module = compile_ok("class C:\n    x = 1\n");
    let class = nested(&module, "C");
    assert_eq!(class.kind, UnitKind::Class);
    let opcodes: Vec<Opcode> = class.instructions().map(|instr| instr.opcode).collect();
    assert_eq!(
        opcodes[..4],
        [Opcode::LoadName, Opcode::StoreName, Opcode::LoadString, Opcode::StoreName]
    );
    assert_eq!(opcodes.last(), Some(&Opcode::ReturnValue));

    let module_ops: Vec<Opcode> = module.instructions().map(|instr| instr.opcode).collect();
    assert_eq!(module_ops[0], Opcode::LoadBuildClass);
    assert!(module_ops.contains(&Opcode::CallFunction), "{module_ops:?}");
}

// === Expressions ===

#[test]
fn literals_pick_compact_loads() {
    let module = compile_ok("a = 7\nb = 127\nc = 1000\nd = 'hi'\ne = None\nf = True\n");
    let loads: Vec<(Opcode, i32)> = listing(&module)
        .into_iter()
        .filter(|(opcode, _)| *opcode != Opcode::StoreName)
        .collect();
    assert_eq!(loads[0], (Opcode::LoadByte, 7));
    assert_eq!(loads[1], (Opcode::LoadByte, 127));
    assert_eq!(loads[2].0, Opcode::LoadLong);
    assert_eq!(loads[3].0, Opcode::LoadString);
    assert_eq!(loads[4].0, Opcode::LoadNone);
    assert_eq!(loads[5].0, Opcode::LoadTrue);
    assert!(module.primitive_constants.contains(&1000));
}

#[test]
fn trailing_expression_is_returned_from_module() {
    let module = compile_ok("x = 2\nx * 3\n");
    let opcodes: Vec<Opcode> = module.instructions().map(|instr| instr.opcode).collect();
    assert_eq!(
        opcodes,
        vec![
            Opcode::LoadByte,
            Opcode::StoreName,
            Opcode::LoadName,
            Opcode::LoadByte,
            Opcode::BinaryOp,
            Opcode::ReturnValue,
        ]
    );
}

#[test]
fn method_call_uses_call_method() {
    let module = compile_ok("def f(o):\n    return o.m(1, 2)\n");
    let f = nested(&module, "f");
    let call = f
        .instructions()
        .find(|instr| instr.opcode == Opcode::CallMethod)
        .expect("short method call");
    assert_eq!(f.names[usize::try_from(call.arg).unwrap()], "m");
    assert_eq!(call.following[0], 2);
}

#[test]
fn keyword_call_builds_keyword_array() {
    let module = compile_ok("def f(g):\n    return g(1, key=2)\n");
    let f = nested(&module, "f");
    let opcodes: Vec<Opcode> = f.instructions().map(|instr| instr.opcode).collect();
    assert!(opcodes.contains(&Opcode::MakeKeyword), "{opcodes:?}");
    assert!(opcodes.contains(&Opcode::CallFunctionKw), "{opcodes:?}");
    assert!(f.constants.contains(&Constant::Str("key".to_owned())));
}

#[test]
fn comprehension_is_a_nested_unit() {
    let module = compile_ok("def f(xs):\n    return [x * 2 for x in xs]\n");
    let f = nested(&module, "f");
    let comp = nested(f, "<listcomp>");
    assert_eq!(comp.kind, UnitKind::Comprehension);
    assert_eq!(comp.argcount, 1);
    assert_eq!(comp.varnames[0], ".0");
    let opcodes: Vec<Opcode> = comp.instructions().map(|instr| instr.opcode).collect();
    assert!(opcodes.contains(&Opcode::ForIter), "{opcodes:?}");
    assert!(opcodes.contains(&Opcode::AddToCollection), "{opcodes:?}");
    assert!(opcodes.contains(&Opcode::JumpBackward), "{opcodes:?}");

    // the outer unit passes the iterator of the outermost iterable
    let f_ops: Vec<Opcode> = f.instructions().map(|instr| instr.opcode).collect();
    assert!(f_ops.contains(&Opcode::GetIter), "{f_ops:?}");
}

#[test]
fn optimize_drops_asserts() {
    let source = "def f(x):\n    assert x, 'boom'\n    return x\n";
    let plain = compile(source, &CompileOptions::new()).unwrap();
    let optimized = compile(source, &CompileOptions::new().optimize(true)).unwrap();
    let has_assert = |code: &CodeUnit| {
        nested(code, "f")
            .instructions()
            .any(|instr| instr.opcode == Opcode::LoadAssertionError)
    };
    assert!(has_assert(&plain));
    assert!(!has_assert(&optimized));
}

// === Disassembly ===

#[test]
fn disassembly_names_every_unit() {
    let module = compile_ok("def f(x):\n    return x + 1\n");
    let text = module.to_string();
    assert!(text.contains("LOAD_FAST"), "{text}");
    assert!(text.contains("BINARY_OP"), "{text}");
    assert!(text.contains("RETURN_VALUE"), "{text}");
    assert!(text.contains("<module>"), "{text}");
}
