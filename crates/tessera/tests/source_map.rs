//! Tests for bci to source position lookups on compiled code.

use pretty_assertions::assert_eq;
use tessera::{
    CodeLoc, CodeUnit, CompileOptions,
    bytecode::{LineLookup, Opcode, decode_ranges},
    compile,
};

fn function(source: &str) -> CodeUnit {
    let module = compile(source, &CompileOptions::new()).unwrap();
    module.nested_units().next().unwrap().clone()
}

fn bci_of(code: &CodeUnit, opcode: Opcode, nth: usize) -> usize {
    code.instructions()
        .filter(|instr| instr.opcode == opcode)
        .nth(nth)
        .unwrap_or_else(|| panic!("no {} #{nth}", opcode.name()))
        .bci
}

// === Lookups ===

#[test]
fn lines_and_columns_of_statements() {
    let f = function("def f(x):\n    a = x\n    return a + 10\n");
    let load_x = bci_of(&f, Opcode::LoadFast, 0);
    assert_eq!(f.bci_to_line(load_x), Some(2));
    assert_eq!(f.bci_to_column(load_x), Some(8));
    assert_eq!(f.bci_to_end_column(load_x), Some(9));

    let ten = bci_of(&f, Opcode::LoadByte, 0);
    assert_eq!(f.bci_to_line(ten), Some(3));
    assert_eq!(f.bci_to_column(ten), Some(15));
    assert_eq!(f.bci_to_end_line(ten), Some(3));
    assert_eq!(f.bci_to_end_column(ten), Some(17));

    // operand bytes share the location of their instruction
    assert_eq!(f.bci_to_range(ten + 1), f.bci_to_range(ten));
}

#[test]
fn unit_records_its_extent() {
    let f = function("def f(x):\n    a = x\n    return a + 10\n");
    assert_eq!((f.start_line, f.start_column), (1, 0));
    assert_eq!((f.end_line, f.end_column), (3, 17));
}

#[test]
fn multi_line_expression_spans_lines() {
    let f = function("def f(g):\n    return g(\n        1,\n    )\n");
    let call = bci_of(&f, Opcode::CallFunction, 0);
    let range = f.bci_to_range(call).unwrap();
    assert_eq!(range.start, CodeLoc::new(2, 11));
    assert_eq!(range.end, CodeLoc::new(4, 5));
}

#[test]
fn out_of_range_bci_has_no_location() {
    let f = function("def f():\n    return 1\n");
    assert_eq!(f.bci_to_line(f.code.len() + 5), None);
}

// === Large deltas ===

/// Line jumps beyond 127 need escape bytes in the table.
#[test]
fn distant_lines_use_escape_bytes() {
    let source = format!("def f():\n    a = 1\n{}    b = 2\n", "\n".repeat(300));
    let f = function(&source);
    let second = bci_of(&f, Opcode::LoadByte, 1);
    assert_eq!(f.bci_to_line(second), Some(303));
    assert!(f.srcoffset_table.contains(&0x80), "{:?}", f.srcoffset_table);
    assert_eq!(f.line_to_bci(303), LineLookup::Bci(second));
    assert_eq!(f.line_to_bci(100), LineLookup::Bci(second));
}

#[test]
fn table_has_one_entry_per_emitted_instruction() {
    let f = function("def f(x):\n    return x.y.z\n");
    let ranges = decode_ranges(&f.srcoffset_table, CodeLoc::new(f.start_line, f.start_column));
    assert_eq!(ranges.len(), f.instructions().count());
}
