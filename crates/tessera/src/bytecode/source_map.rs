//! Delta-encoded mapping from bytecode indices to source ranges.
//!
//! Every emitted instruction (including `ExtendedArg` prefixes) contributes four
//! signed deltas, one each for start line, start column, end line and end
//! column, relative to the previous instruction. A delta in `[-127, 127]` is a
//! single byte. Larger magnitudes are prefixed by escape bytes (`0x80`, i.e.
//! -128), each adding 127 to the magnitude; the terminal byte carries the rest
//! of the magnitude and the sign.

use crate::location::{CodeLoc, CodeRange};

use super::op::Opcode;

const ESCAPE: u8 = 0x80;
const DIRECT_MAX: u32 = 127;

/// Accumulates the encoded table while instructions are emitted.
#[derive(Debug, Clone)]
pub struct SourceMapBuilder {
    table: Vec<u8>,
    last: [i64; 4],
}

impl SourceMapBuilder {
    /// Creates a builder whose first delta is relative to `start` for both ends.
    #[must_use]
    pub fn new(start: CodeLoc) -> Self {
        let line = i64::from(start.line);
        let column = i64::from(start.column);
        Self {
            table: Vec::new(),
            last: [line, column, line, column],
        }
    }

    /// Appends the location of one emitted instruction.
    pub fn push(&mut self, range: CodeRange) {
        let current = [
            i64::from(range.start.line),
            i64::from(range.start.column),
            i64::from(range.end.line),
            i64::from(range.end.column),
        ];
        for (last, value) in self.last.iter_mut().zip(current) {
            write_delta(&mut self.table, value - *last);
            *last = value;
        }
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.table
    }
}

fn write_delta(out: &mut Vec<u8>, delta: i64) {
    let mut magnitude = delta.unsigned_abs();
    while magnitude > u64::from(DIRECT_MAX) {
        out.push(ESCAPE);
        magnitude -= u64::from(DIRECT_MAX);
    }
    // magnitude is now at most 127 so the cast is lossless
    let terminal = i8::try_from(magnitude).unwrap_or(i8::MAX);
    let terminal = if delta < 0 { -terminal } else { terminal };
    out.push(terminal.to_le_bytes()[0]);
}

/// Reads deltas back out of an encoded table.
struct DeltaReader<'a> {
    table: &'a [u8],
    pos: usize,
}

impl DeltaReader<'_> {
    fn next_delta(&mut self) -> Option<i64> {
        let mut overflow = 0i64;
        loop {
            let byte = *self.table.get(self.pos)?;
            self.pos += 1;
            if byte == ESCAPE {
                overflow += i64::from(DIRECT_MAX);
                continue;
            }
            let terminal = i64::from(i8::from_le_bytes([byte]));
            if terminal < 0 {
                overflow = -overflow;
            }
            return Some(overflow + terminal);
        }
    }
}

/// Decodes every range from an encoded table, one per emitted instruction.
///
/// Stops at the end of the table, or at a truncated entry.
#[must_use]
pub fn decode_ranges(table: &[u8], start: CodeLoc) -> Vec<CodeRange> {
    let mut reader = DeltaReader { table, pos: 0 };
    let line = i64::from(start.line);
    let column = i64::from(start.column);
    let mut state = [line, column, line, column];
    let mut ranges = Vec::new();
    'outer: loop {
        for value in &mut state {
            let Some(delta) = reader.next_delta() else {
                break 'outer;
            };
            *value += delta;
        }
        ranges.push(CodeRange::new(
            CodeLoc::new(to_u32(state[0]), to_u32(state[1])),
            CodeLoc::new(to_u32(state[2]), to_u32(state[3])),
        ));
    }
    ranges
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

/// Decoded per-bci view of the table.
///
/// Every byte of an instruction maps to the instruction's range, so any bci
/// (including operand bytes) can be looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap {
    ranges: Vec<CodeRange>,
}

impl SourceMap {
    /// Decodes `table` against the instruction boundaries of `code`.
    #[must_use]
    pub fn new(code: &[u8], table: &[u8], start: CodeLoc) -> Self {
        let decoded = decode_ranges(table, start);
        let mut ranges = Vec::with_capacity(code.len());
        let mut entries = decoded.into_iter();
        let mut bci = 0;
        while bci < code.len() {
            let length = Opcode::from_byte(code[bci]).map_or(1, Opcode::length);
            let range = entries.next().unwrap_or_default();
            for _ in 0..length.min(code.len() - bci) {
                ranges.push(range);
            }
            bci += length;
        }
        Self { ranges }
    }

    #[must_use]
    pub fn range(&self, bci: usize) -> Option<CodeRange> {
        self.ranges.get(bci).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(a: u32, b: u32, c: u32, d: u32) -> CodeRange {
        CodeRange::new(CodeLoc::new(a, b), CodeLoc::new(c, d))
    }

    #[test]
    fn small_deltas_use_one_byte_each() {
        let mut builder = SourceMapBuilder::new(CodeLoc::new(1, 0));
        builder.push(range(1, 4, 1, 9));
        builder.push(range(2, 0, 2, 3));
        let table = builder.finish();
        assert_eq!(table, [0, 4, 0, 9, 1, 0xfc, 1, 0xfa]);
    }

    #[test]
    fn escape_bytes_extend_magnitude() {
        let mut out = Vec::new();
        write_delta(&mut out, 128);
        assert_eq!(out, [ESCAPE, 1]);
        out.clear();
        write_delta(&mut out, -128);
        assert_eq!(out, [ESCAPE, 0xff]);
        out.clear();
        write_delta(&mut out, 254);
        assert_eq!(out, [ESCAPE, 127]);
        out.clear();
        write_delta(&mut out, -127);
        assert_eq!(out, [0x81]);
    }

    #[test]
    fn every_byte_of_an_instruction_maps_to_its_range() {
        let code = [Opcode::LoadFast as u8, 0, Opcode::ReturnValue as u8];
        let mut builder = SourceMapBuilder::new(CodeLoc::new(3, 0));
        builder.push(range(3, 4, 3, 5));
        builder.push(range(3, 0, 3, 5));
        let map = SourceMap::new(&code, &builder.finish(), CodeLoc::new(3, 0));
        assert_eq!(map.len(), 3);
        assert_eq!(map.range(0), Some(range(3, 4, 3, 5)));
        assert_eq!(map.range(1), Some(range(3, 4, 3, 5)));
        assert_eq!(map.range(2), Some(range(3, 0, 3, 5)));
        assert_eq!(map.range(3), None);
    }
}
