//! Structural invariants checked over a corpus of programs.
//!
//! Assembly already asserts consistent stack depths while computing
//! `stack_size`, so compiling the corpus without a panic is itself part of the
//! test. On top of that every produced unit (and every nested unit) is checked
//! for well-formed exception ranges, jump targets and source map coverage.

use std::fmt::Write;

use tessera::{
    CodeUnit, CompileOptions,
    bytecode::{CodeFlags, Opcode},
    compile,
};

const CORPUS: &[&str] = &[
    "x = 1\n",
    "def f(a, b=1, *args, c, d=2, **kw):\n    return a + b\n",
    "def f(xs):\n    total = 0\n    for x in xs:\n        if x > 2:\n            break\n        total += x\n    else:\n        total = -1\n    return total\n",
    "def f(n):\n    while n:\n        n -= 1\n        if n == 3:\n            continue\n    return n\n",
    "def f(m):\n    with m as a, m as b:\n        return a\n",
    "def f():\n    try:\n        g()\n    except ValueError as e:\n        return e\n    except:\n        pass\n    else:\n        h()\n    finally:\n        k()\n",
    "def f(xs):\n    for x in xs:\n        try:\n            continue\n        finally:\n            break\n",
    "def f():\n    try:\n        return 1\n    finally:\n        print('done')\n",
    "def f(xs):\n    for x in xs:\n        with x:\n            try:\n                return x\n            except KeyError:\n                break\n",
    "class C(Base, metaclass=M):\n    'doc'\n    def m(self):\n        return __class__\n",
    "def outer():\n    x = 1\n    def inner():\n        nonlocal x\n        x += 1\n        return x\n    return inner\n",
    "def f(d, k):\n    d[k] += 1\n    d.a -= 2\n    a, *rest, b = d\n    del d[k], d.a\n",
    "def f(a, b, c):\n    return a < b < c and not (a or b) or c if a else b\n",
    "def f(xs):\n    return {k: v for k, v in xs if k for v in k}, {x for x in xs}, [y for x in xs for y in x if y]\n",
    "def f(g, xs, kw):\n    return g(1, *xs, key=2, **kw), g.m(*xs), g(a=1, b=2)\n",
    "import os.path\nimport a.b.c as d\nfrom . import x as y\nfrom m import *\n",
    "def f(x):\n    assert x, 'bad'\n    raise ValueError('x') from None\n",
    "lambda a, b=2: a * b\n",
    "x = [1, 2, 3][1:2:1], (1,), {'a': 1, **{}}, {*[1], 2}\n",
    "def f():\n    global g\n    g = (y := 3)\n    return y\n",
    "def f(x):\n    if x:\n        return 1\n    elif x is None:\n        return 2\n    return 3\n",
];

/// A loop whose body is too long for one-byte jumps: the exit test and the
/// back edge go far while the `if` jumps inside their span stay short.
fn long_loop() -> String {
    let mut source = String::from("def f(n):\n    while n:\n");
    for block in 0..4 {
        writeln!(source, "        if n > {block}:").unwrap();
        for i in 0..30 {
            writeln!(source, "            a{i} = g{block}").unwrap();
        }
    }
    source.push_str("        n -= 1\n    return n\n");
    source
}

/// A function referencing more names than a one-byte operand can index.
fn many_names() -> String {
    let names: Vec<String> = (0..300).map(|i| format!("g{i}")).collect();
    format!("def f():\n    return [{}]\n", names.join(", "))
}

fn all_units(code: &CodeUnit) -> Vec<&CodeUnit> {
    let mut units = vec![code];
    let mut i = 0;
    while i < units.len() {
        units.extend(units[i].nested_units());
        i += 1;
    }
    units
}

fn compile_corpus() -> Vec<CodeUnit> {
    CORPUS
        .iter()
        .map(|source| (*source).to_owned())
        .chain([long_loop(), many_names()])
        .map(|source| {
            compile(&source, &CompileOptions::new()).unwrap_or_else(|err| panic!("failed to compile {source:?}: {err}"))
        })
        .collect()
}

fn function(source: &str) -> CodeUnit {
    let module = compile(source, &CompileOptions::new()).unwrap();
    module.nested_units().next().unwrap().clone()
}

// === Exception table ===

#[test]
fn exception_ranges_are_well_formed() {
    for module in compile_corpus() {
        for unit in all_units(&module) {
            let len = unit.code.len() as u32;
            let ranges = &unit.exception_handler_ranges;
            for range in ranges {
                assert!(range.start < range.end, "{}: empty range {range:?}", unit.qualname);
                assert!(range.end <= len, "{}: range past the end {range:?}", unit.qualname);
                assert!(range.handler < len, "{}: handler past the end {range:?}", unit.qualname);
                assert!(
                    !range.contains(range.handler as usize),
                    "{}: handler inside its own range {range:?}",
                    unit.qualname
                );
                assert!(
                    range.stack_depth < unit.stack_size,
                    "{}: handler depth {} not below max {}",
                    unit.qualname,
                    range.stack_depth,
                    unit.stack_size
                );
            }
            assert!(
                ranges.windows(2).all(|pair| pair[0].start <= pair[1].start),
                "{}: ranges not sorted by start",
                unit.qualname
            );
            for (i, a) in ranges.iter().enumerate() {
                for b in &ranges[i + 1..] {
                    let disjoint = a.end <= b.start || b.end <= a.start;
                    let nested = (a.start <= b.start && b.end <= a.end) || (b.start <= a.start && a.end <= b.end);
                    assert!(disjoint || nested, "{}: {a:?} overlaps {b:?}", unit.qualname);
                }
            }
        }
    }
}

#[test]
fn try_except_has_handler() {
    let module = compile(
        "def f():\n    try:\n        g()\n    except E:\n        pass\n",
        &CompileOptions::new(),
    )
    .unwrap();
    let f = module.nested_units().next().unwrap();
    let call = f
        .instructions()
        .find(|instr| instr.opcode == Opcode::CallFunction)
        .expect("body calls g");
    let range = f.find_handler(call.bci).expect("call is protected");
    assert_eq!(range.stack_depth, 0);
    let entry = f.instructions().find(|instr| instr.bci == range.handler as usize).unwrap();
    assert_eq!(entry.opcode, Opcode::PushExcInfo);
}

// === Instruction stream ===

#[test]
fn jump_targets_land_on_instructions() {
    for module in compile_corpus() {
        for unit in all_units(&module) {
            let starts: Vec<usize> = unit.instructions().map(|instr| instr.bci).collect();
            for instr in unit.instructions() {
                if let Some(target) = instr.jump_target() {
                    assert!(
                        starts.binary_search(&target).is_ok(),
                        "{}: jump at {} lands mid-instruction at {target}",
                        unit.qualname,
                        instr.bci
                    );
                }
            }
        }
    }
}

// === Wide encodings ===

#[test]
fn long_loop_uses_far_jumps() {
    let f = function(&long_loop());
    let opcodes: Vec<Opcode> = f.instructions().map(|instr| instr.opcode).collect();
    assert!(opcodes.contains(&Opcode::PopAndJumpIfFalseFar), "{f}");
    assert!(opcodes.contains(&Opcode::PopAndJumpIfFalse), "{f}");

    let back_edge = f
        .instructions()
        .find(|instr| instr.opcode == Opcode::JumpBackwardFar)
        .unwrap_or_else(|| panic!("no far back edge in\n{f}"));
    let loop_test = f
        .instructions()
        .find(|instr| instr.opcode == Opcode::LoadFast)
        .expect("loop test loads n");
    assert_eq!(back_edge.jump_target(), Some(loop_test.bci));

    let exit = f
        .instructions()
        .find(|instr| instr.opcode == Opcode::PopAndJumpIfFalseFar)
        .unwrap();
    let target = exit.jump_target().unwrap();
    assert!(target > back_edge.bci, "loop exit lands inside the loop at {target}");
}

#[test]
fn wide_name_indexes_use_extended_args() {
    let f = function(&many_names());
    let instrs: Vec<_> = f.instructions().collect();
    let wide: Vec<usize> = instrs
        .iter()
        .enumerate()
        .filter(|(_, instr)| instr.opcode == Opcode::LoadGlobal && instr.arg > 255)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(wide.len(), 300 - 256);
    for i in wide {
        assert_eq!(instrs[i - 1].opcode, Opcode::ExtendedArg, "{f}");
        assert_eq!(instrs[i - 1].arg, 1);
    }
    assert_eq!(f.names.len(), 300);
}

#[test]
fn every_unit_ends_in_a_terminator() {
    for module in compile_corpus() {
        for unit in all_units(&module) {
            let last = unit.instructions().last().expect("units are never empty");
            assert!(
                last.opcode.is_unconditional(),
                "{} ends with {}",
                unit.qualname,
                last.opcode.name()
            );
        }
    }
}

#[test]
fn quicken_marks_align_with_code() {
    for module in compile_corpus() {
        for unit in all_units(&module) {
            assert_eq!(unit.output_can_quicken.len(), unit.code.len(), "{}", unit.qualname);
        }
    }
}

#[test]
fn nofree_matches_cells_and_frees() {
    for module in compile_corpus() {
        for unit in all_units(&module) {
            let nofree = unit.cellvars.is_empty() && unit.freevars.is_empty();
            assert_eq!(
                unit.flags & CodeFlags::NOFREE != 0,
                nofree,
                "{}: flags {:#x}",
                unit.qualname,
                unit.flags
            );
        }
    }
}

// === Source map ===

#[test]
fn every_instruction_has_a_location() {
    for module in compile_corpus() {
        for unit in all_units(&module) {
            for instr in unit.instructions() {
                let range = unit
                    .bci_to_range(instr.bci)
                    .unwrap_or_else(|| panic!("{}: no location for bci {}", unit.qualname, instr.bci));
                assert!(range.start <= range.end, "{}: inverted range {range}", unit.qualname);
                assert!(range.start.line >= 1, "{}: line 0 at bci {}", unit.qualname, instr.bci);
            }
        }
    }
}
