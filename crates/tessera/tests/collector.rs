//! Tests for batched collection building.
//!
//! A small stack evaluator runs the collection opcodes of compiled modules so
//! that different batch sizes can be checked for building the same value.

use ahash::AHashMap;
use pretty_assertions::assert_eq;
use tessera::{
    CodeUnit, CompileOptions,
    bytecode::{CollectionBits, Opcode},
    compile,
};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Seq { kind: i32, items: Vec<Value> },
}

/// Evaluates a module made of literals, name loads and collection opcodes.
fn evaluate(code: &CodeUnit, globals: &AHashMap<&str, Value>) -> Value {
    let mut stack: Vec<Value> = Vec::new();
    for instr in code.instructions() {
        let arg = instr.arg;
        match instr.opcode {
            Opcode::ExtendedArg => {}
            Opcode::LoadByte => stack.push(Value::Int(i64::from(arg))),
            Opcode::LoadName => {
                let name = &code.names[usize::try_from(arg).unwrap()];
                stack.push(globals[name.as_str()].clone());
            }
            Opcode::CollectionFromStack => {
                let count = usize::try_from(CollectionBits::count(arg)).unwrap();
                let items = stack.split_off(stack.len() - count);
                stack.push(Value::Seq {
                    kind: CollectionBits::kind(arg),
                    items,
                });
            }
            Opcode::CollectionAddStack => {
                let count = usize::try_from(CollectionBits::count(arg)).unwrap();
                let items = stack.split_off(stack.len() - count);
                let Some(Value::Seq { items: target, .. }) = stack.last_mut() else {
                    panic!("no collection under the pending items");
                };
                target.extend(items);
            }
            Opcode::CollectionFromCollection => {
                let Some(Value::Seq { items, .. }) = stack.pop() else {
                    panic!("splat of a non-collection");
                };
                stack.push(Value::Seq {
                    kind: CollectionBits::kind(arg),
                    items,
                });
            }
            Opcode::CollectionAddCollection => {
                let Some(Value::Seq { items, .. }) = stack.pop() else {
                    panic!("splat of a non-collection");
                };
                let Some(Value::Seq { items: target, .. }) = stack.last_mut() else {
                    panic!("no collection under the splat");
                };
                target.extend(items);
            }
            Opcode::ReturnValue => return stack.pop().expect("return needs a value"),
            other => panic!("evaluator does not handle {}", other.name()),
        }
        assert!(
            stack.len() <= code.stack_size as usize,
            "stack exceeded computed size at bci {}",
            instr.bci
        );
    }
    panic!("module did not return");
}

fn ints(kind: i32, values: impl IntoIterator<Item = i64>) -> Value {
    Value::Seq {
        kind,
        items: values.into_iter().map(Value::Int).collect(),
    }
}

fn compile_with_batch(source: &str, batch_size: u8) -> CodeUnit {
    let options = CompileOptions::new().collection_batch_size(batch_size);
    compile(source, &options).unwrap()
}

// === Starred elements ===

/// `[1, 2, *xs, 3]` builds the same list whatever the batch size.
#[test]
fn starred_list_is_batch_size_independent() {
    let globals = AHashMap::from([("xs", ints(CollectionBits::LIST, [10, 11]))]);
    let expected = ints(CollectionBits::LIST, [1, 2, 10, 11, 3]);
    for batch_size in [31, 4, 2, 1] {
        let code = compile_with_batch("[1, 2, *xs, 3]", batch_size);
        assert_eq!(evaluate(&code, &globals), expected, "batch size {batch_size}");
    }
}

#[test]
fn starred_list_opcodes() {
    let code = compile_with_batch("[1, 2, *xs, 3]", 31);
    let listing: Vec<(Opcode, i32)> = code.instructions().map(|instr| (instr.opcode, instr.arg)).collect();
    assert_eq!(
        listing,
        vec![
            (Opcode::LoadByte, 1),
            (Opcode::LoadByte, 2),
            (Opcode::CollectionFromStack, CollectionBits::LIST | 2),
            (Opcode::LoadName, 0),
            (Opcode::CollectionAddCollection, CollectionBits::LIST),
            (Opcode::LoadByte, 3),
            (Opcode::CollectionAddStack, CollectionBits::LIST | 1),
            (Opcode::ReturnValue, 0),
        ]
    );
}

#[test]
fn leading_splat_converts_the_iterable() {
    let globals = AHashMap::from([("xs", ints(CollectionBits::TUPLE, [5]))]);
    let code = compile_with_batch("[*xs, 6]", 31);
    assert_eq!(code.instructions().nth(1).unwrap().opcode, Opcode::CollectionFromCollection);
    assert_eq!(evaluate(&code, &globals), ints(CollectionBits::LIST, [5, 6]));
}

// === Long literals ===

/// Literals longer than one batch are flushed in pieces and never need more
/// stack than a batch plus the collection itself.
#[test]
fn long_list_is_flushed_in_batches() {
    let elements: Vec<String> = (0..40).map(|i| i.to_string()).collect();
    let source = format!("[{}]", elements.join(", "));
    let expected = ints(CollectionBits::LIST, 0..40);
    for batch_size in [31, 8, 1] {
        let code = compile_with_batch(&source, batch_size);
        assert_eq!(evaluate(&code, &AHashMap::new()), expected, "batch size {batch_size}");
        assert!(
            code.stack_size <= u32::from(batch_size) + 1,
            "batch size {batch_size} needed stack {}",
            code.stack_size
        );
    }
}

#[test]
fn empty_list_is_built_from_zero_items() {
    let code = compile_with_batch("[]", 31);
    let first = code.instructions().next().unwrap();
    assert_eq!(first.opcode, Opcode::CollectionFromStack);
    assert_eq!(first.arg, CollectionBits::LIST);
    assert_eq!(evaluate(&code, &AHashMap::new()), ints(CollectionBits::LIST, []));
}

#[test]
fn set_literal_uses_set_bits() {
    let code = compile_with_batch("{1, 2}", 31);
    assert_eq!(evaluate(&code, &AHashMap::new()), ints(CollectionBits::SET, [1, 2]));
}

/// A tuple cannot be extended in place, so one longer than a batch is built as
/// a list and converted.
#[test]
fn tuple_longer_than_a_batch_goes_through_a_list() {
    let expected = ints(CollectionBits::TUPLE, [1, 2, 3]);
    for batch_size in [31, 3, 2, 1] {
        let code = compile_with_batch("(1, 2, 3)", batch_size);
        assert_eq!(evaluate(&code, &AHashMap::new()), expected, "batch size {batch_size}");
        let converted = code
            .instructions()
            .any(|instr| instr.opcode == Opcode::CollectionFromCollection);
        assert_eq!(converted, batch_size < 3, "batch size {batch_size}");
    }
}
