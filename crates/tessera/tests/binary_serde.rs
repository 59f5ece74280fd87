//! Tests for binary serialization of compiled code units.
//!
//! Code units are dumped with postcard so compiled modules can be cached
//! without recompiling the source.

use pretty_assertions::assert_eq;
use tessera::{CodeUnit, CompileOptions, bytecode::Constant, compile};

const PROGRAM: &str = r"
import math

class Point:
    'A point.'
    def __init__(self, x, y=0.5):
        self.x = x
        self.y = y

    def norm(self):
        return math.sqrt(self.x ** 2 + self.y ** 2)

def scale(points, k=2 + 3j):
    return [Point(p.x * k, p.y * k) for p in points if p]

big = 12345678901234567890123
data = b'\x00\xff'
try:
    scale([Point(1)])
except (TypeError, ValueError) as e:
    pass
";

#[test]
fn dump_load_round_trips() {
    let code = compile(PROGRAM, &CompileOptions::new().filename("point.py")).unwrap();
    let bytes = code.dump().unwrap();
    let loaded = CodeUnit::load(&bytes).unwrap();
    assert_eq!(loaded, code);
    assert_eq!(loaded.filename, "point.py");
}

#[test]
fn loaded_unit_keeps_lookups() {
    let code = compile(PROGRAM, &CompileOptions::new()).unwrap();
    let loaded = CodeUnit::load(&code.dump().unwrap()).unwrap();
    for instr in code.instructions() {
        assert_eq!(loaded.bci_to_range(instr.bci), code.bci_to_range(instr.bci));
    }
    assert_eq!(loaded.to_string(), code.to_string());
}

#[test]
fn nested_units_survive() {
    let code = compile(PROGRAM, &CompileOptions::new()).unwrap();
    let loaded = CodeUnit::load(&code.dump().unwrap()).unwrap();
    let names: Vec<&str> = loaded.nested_units().map(|unit| unit.name.as_str()).collect();
    assert_eq!(names, vec!["Point", "scale"]);
    assert!(
        loaded
            .constants
            .iter()
            .any(|constant| matches!(constant, Constant::BigInt(_)))
    );
}

#[test]
fn truncated_input_is_an_error() {
    let code = compile("x = 1\n", &CompileOptions::new()).unwrap();
    let bytes = code.dump().unwrap();
    assert!(CodeUnit::load(&bytes[..bytes.len() / 2]).is_err());
}
