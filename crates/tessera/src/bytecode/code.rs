//! The finished, immutable bytecode artifact and its derived views.

use std::{fmt, sync::OnceLock};

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{
    op::{BinaryOp, CollectionBits, Opcode, UnaryOp},
    source_map::SourceMap,
};
use crate::location::{CodeLoc, CodeRange};

/// Entries of the object constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Str(String),
    Bytes(Vec<u8>),
    BigInt(BigInt),
    Complex { real: f64, imag: f64 },
    /// Import lists (`from m import a, b`).
    StrArray(Vec<String>),
    Code(Box<CodeUnit>),
}

impl fmt::Display for Constant {
    /// Formats the constant the way the source language's `repr` would.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Str(s) => write_str_repr(f, s),
            Self::Bytes(bytes) => {
                f.write_str("b'")?;
                for &b in bytes {
                    match b {
                        b'\'' => f.write_str("\\'")?,
                        b'\\' => f.write_str("\\\\")?,
                        b'\n' => f.write_str("\\n")?,
                        b'\r' => f.write_str("\\r")?,
                        b'\t' => f.write_str("\\t")?,
                        0x20..=0x7e => write!(f, "{}", char::from(b))?,
                        _ => write!(f, "\\x{b:02x}")?,
                    }
                }
                f.write_str("'")
            }
            Self::BigInt(value) => write!(f, "{value}"),
            Self::Complex { real, imag } => {
                if *real == 0.0 && real.is_sign_positive() {
                    write!(f, "{}j", FloatRepr(*imag))
                } else {
                    let sign = if imag.is_sign_negative() { "-" } else { "+" };
                    write!(f, "({}{sign}{}j)", FloatRepr(*real), FloatRepr(imag.abs()))
                }
            }
            Self::StrArray(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_str_repr(f, item)?;
                }
                f.write_str("]")
            }
            Self::Code(code) => f.write_str(&code.qualname),
        }
    }
}

fn write_str_repr(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    write!(f, "{quote}")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c == quote => write!(f, "\\{c}")?,
            c if c.is_control() => write!(f, "\\x{:02x}", u32::from(c))?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "{quote}")
}

/// Formats floats like the source language: integral values keep a `.0`.
struct FloatRepr(f64);

impl fmt::Display for FloatRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        if value.is_nan() {
            f.write_str("nan")
        } else if value.is_infinite() {
            f.write_str(if value > 0.0 { "inf" } else { "-inf" })
        } else if value.fract() == 0.0 && value.abs() < 1e16 {
            write!(f, "{value:.1}")
        } else {
            write!(f, "{value}")
        }
    }
}

/// One exception table entry: instructions in `start..end` are protected by
/// the handler at `handler`, entered with the value stack cut to `stack_depth`
/// items (the exception is pushed on top of those).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub stack_depth: u32,
}

impl HandlerRange {
    #[must_use]
    pub fn contains(&self, bci: usize) -> bool {
        (self.start as usize..self.end as usize).contains(&bci)
    }

    fn span(&self) -> u32 {
        self.end - self.start
    }
}

/// Code unit flag bits.
pub struct CodeFlags;

impl CodeFlags {
    pub const OPTIMIZED: u32 = 0x1;
    pub const NEWLOCALS: u32 = 0x2;
    pub const VARARGS: u32 = 0x4;
    pub const VARKEYWORDS: u32 = 0x8;
    pub const NESTED: u32 = 0x10;
    pub const NOFREE: u32 = 0x40;

    const NAMES: [(u32, &'static str); 6] = [
        (Self::OPTIMIZED, "CO_OPTIMIZED"),
        (Self::NEWLOCALS, "CO_NEWLOCALS"),
        (Self::VARARGS, "CO_VARARGS"),
        (Self::VARKEYWORDS, "CO_VARKEYWORDS"),
        (Self::NESTED, "CO_NESTED"),
        (Self::NOFREE, "CO_NOFREE"),
    ];
}

/// What kind of scope a code unit was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Module,
    Function,
    Lambda,
    Class,
    Comprehension,
}

/// Result of mapping a source line to a bytecode index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLookup {
    Bci(usize),
    /// The line is after every instruction of the unit.
    AfterCode,
    /// The line is before the unit starts.
    BeforeCode,
}

/// Compiled bytecode for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub kind: UnitKind,
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub flags: u32,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,

    pub code: Vec<u8>,
    pub srcoffset_table: Vec<u8>,
    /// Sorted by `start`.
    pub exception_handler_ranges: Vec<HandlerRange>,
    pub stack_size: u32,

    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    /// For each cell, the argument it is initialised from, if any.
    pub cell2arg: Vec<Option<u32>>,
    pub constants: Vec<Constant>,
    /// `i64` values and `f64` bit patterns referenced by `LoadLong`/`LoadDouble`.
    pub primitive_constants: Vec<u64>,
    /// Nonzero at instruction starts whose opcode the runtime may specialize.
    pub output_can_quicken: Vec<u8>,

    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,

    #[serde(skip)]
    pub(crate) source_map: LazySourceMap,
}

/// Cached decoded source map; ignored for equality and serialization.
#[derive(Debug, Clone, Default)]
pub(crate) struct LazySourceMap(OnceLock<SourceMap>);

impl PartialEq for LazySourceMap {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

/// A decoded instruction, see [`CodeUnit::instructions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub bci: usize,
    pub opcode: Opcode,
    /// Immediate including any `ExtendedArg` prefixes; signed for `LoadByte`.
    pub arg: i32,
    pub following: SmallVec<[u8; 1]>,
}

impl DecodedInstruction {
    #[must_use]
    pub fn next_bci(&self) -> usize {
        self.bci + self.opcode.length()
    }

    /// Absolute target of a jump instruction.
    #[must_use]
    pub fn jump_target(&self) -> Option<usize> {
        if !self.opcode.is_jump() {
            return None;
        }
        let distance = usize::try_from(self.arg).ok()?;
        if self.opcode.is_backward_jump() {
            self.bci.checked_sub(distance)
        } else {
            Some(self.bci + distance)
        }
    }

    #[must_use]
    pub fn stack_effect(&self, jump: bool) -> i32 {
        self.opcode.stack_effect(self.arg, &self.following, jump)
    }
}

/// Iterator over the instructions of a code array.
///
/// `ExtendedArg` prefixes are yielded as instructions of their own; their
/// value is folded into the immediate of the instruction they precede.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    code: &'a [u8],
    bci: usize,
    extended: i32,
}

impl<'a> Instructions<'a> {
    #[must_use]
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            bci: 0,
            extended: 0,
        }
    }
}

impl Iterator for Instructions<'_> {
    type Item = DecodedInstruction;

    fn next(&mut self) -> Option<Self::Item> {
        let bci = self.bci;
        let opcode = Opcode::from_byte(*self.code.get(bci)?)?;
        let operands = self.code.get(bci + 1..bci + opcode.length())?;
        self.bci = bci + opcode.length();
        let immediate_len = opcode.arg_length() - opcode.following_arg_length();
        let arg = if opcode.is_far_jump() {
            i32::from(u16::from_le_bytes([operands[0], operands[1]]))
        } else if opcode == Opcode::LoadByte {
            i32::from(i8::from_le_bytes([operands[0]]))
        } else if immediate_len == 1 {
            (self.extended << 8) | i32::from(operands[0])
        } else {
            0
        };
        self.extended = if opcode == Opcode::ExtendedArg { arg } else { 0 };
        Some(DecodedInstruction {
            bci,
            opcode,
            arg,
            following: operands[immediate_len..].iter().copied().collect(),
        })
    }
}

impl CodeUnit {
    /// Decodes the instruction stream.
    #[must_use]
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions::new(&self.code)
    }

    /// Nested code units referenced from the constant pool.
    pub fn nested_units(&self) -> impl Iterator<Item = &Self> {
        self.constants.iter().filter_map(|c| match c {
            Constant::Code(code) => Some(code.as_ref()),
            _ => None,
        })
    }

    fn source_map(&self) -> &SourceMap {
        self.source_map.0.get_or_init(|| {
            SourceMap::new(
                &self.code,
                &self.srcoffset_table,
                CodeLoc::new(self.start_line, self.start_column),
            )
        })
    }

    /// Source range of the instruction covering `bci`.
    #[must_use]
    pub fn bci_to_range(&self, bci: usize) -> Option<CodeRange> {
        self.source_map().range(bci)
    }

    #[must_use]
    pub fn bci_to_line(&self, bci: usize) -> Option<u32> {
        self.bci_to_range(bci).map(|range| range.start.line)
    }

    #[must_use]
    pub fn bci_to_column(&self, bci: usize) -> Option<u32> {
        self.bci_to_range(bci).map(|range| range.start.column)
    }

    #[must_use]
    pub fn bci_to_end_line(&self, bci: usize) -> Option<u32> {
        self.bci_to_range(bci).map(|range| range.end.line)
    }

    #[must_use]
    pub fn bci_to_end_column(&self, bci: usize) -> Option<u32> {
        self.bci_to_range(bci).map(|range| range.end.column)
    }

    /// Finds the first instruction of the nearest line at or after `line`.
    #[must_use]
    pub fn line_to_bci(&self, line: u32) -> LineLookup {
        if line == self.start_line {
            return LineLookup::Bci(0);
        }
        if line < self.start_line {
            return if self.kind == UnitKind::Module {
                LineLookup::Bci(0)
            } else {
                LineLookup::BeforeCode
            };
        }
        let mut best: Option<(u32, usize)> = None;
        for instr in self.instructions() {
            let Some(instr_line) = self.bci_to_line(instr.bci) else {
                continue;
            };
            if instr_line >= line && best.is_none_or(|(best_line, _)| instr_line < best_line) {
                best = Some((instr_line, instr.bci));
            }
        }
        best.map_or(LineLookup::AfterCode, |(_, bci)| LineLookup::Bci(bci))
    }

    /// The innermost handler range protecting `bci`.
    #[must_use]
    pub fn find_handler(&self, bci: usize) -> Option<HandlerRange> {
        self.exception_handler_ranges
            .iter()
            .filter(|range| range.contains(bci))
            .min_by_key(|range| range.span())
            .copied()
    }

    /// Serializes the code unit, including nested units, to a binary format.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserializes a code unit produced by `dump()`.
    ///
    /// # Errors
    /// Returns an error if deserialization fails.
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    fn deref_name(&self, index: usize) -> Option<&str> {
        self.cellvars
            .get(index)
            .or_else(|| self.freevars.get(index.checked_sub(self.cellvars.len())?))
            .map(String::as_str)
    }

    fn constant_qualname(&self, index: usize) -> Option<&str> {
        match self.constants.get(index)? {
            Constant::Code(code) => Some(&code.qualname),
            _ => None,
        }
    }

    /// Operand column and meaning column of one disassembly line.
    fn describe(&self, instr: &DecodedInstruction) -> (String, Option<String>) {
        let arg = instr.arg;
        let index = usize::try_from(arg).unwrap_or(usize::MAX);
        let following = i32::from(instr.following.first().copied().unwrap_or(0));
        let name = |table: &[String]| table.get(index).cloned();
        match instr.opcode.short_form() {
            Opcode::LoadConst
            | Opcode::LoadBigint
            | Opcode::LoadString
            | Opcode::LoadBytes
            | Opcode::LoadComplex
            | Opcode::MakeKeyword => (format_arg(arg), self.constants.get(index).map(ToString::to_string)),
            Opcode::LoadLong => (
                format_arg(arg),
                self.primitive_constants
                    .get(index)
                    .map(|&bits| i64::from_le_bytes(bits.to_le_bytes()).to_string()),
            ),
            Opcode::LoadDouble => (
                format_arg(arg),
                self.primitive_constants
                    .get(index)
                    .map(|&bits| FloatRepr(f64::from_bits(bits)).to_string()),
            ),
            Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::DeleteDeref
            | Opcode::LoadClassderef
            | Opcode::LoadClosure => (format_arg(arg), self.deref_name(index).map(ToOwned::to_owned)),
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => (format_arg(arg), name(&self.varnames)),
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::ImportStar
            | Opcode::CallMethodVarargs => (format_arg(arg), name(&self.names)),
            Opcode::CallMethod => (format_arg(following), name(&self.names)),
            Opcode::MakeFunction => (
                format_arg(following),
                self.constant_qualname(index).map(ToOwned::to_owned),
            ),
            Opcode::UnaryOp => (
                format_arg(arg),
                u8::try_from(arg)
                    .ok()
                    .and_then(UnaryOp::from_repr)
                    .map(|op| op.name().to_owned()),
            ),
            Opcode::BinaryOp => (
                format_arg(arg),
                u8::try_from(arg)
                    .ok()
                    .and_then(BinaryOp::from_repr)
                    .map(|op| op.name().to_owned()),
            ),
            Opcode::CollectionFromStack
            | Opcode::CollectionAddStack
            | Opcode::CollectionAddCollection
            | Opcode::CollectionFromCollection
            | Opcode::AddToCollection => (
                format_arg(CollectionBits::count(arg)),
                Some(CollectionBits::kind_name(arg).to_owned()),
            ),
            Opcode::UnpackEx => (format_arg(arg), Some(format!("{arg}, {following}"))),
            op if op.is_jump() => (
                format_arg(arg),
                instr.jump_target().map(|target| format!("to {target}")),
            ),
            op if op.arg_length() > 0 => (format_arg(arg), None),
            _ => (String::new(), None),
        }
    }

    fn write_disassembly(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Disassembly of {}:", self.qualname)?;
        let flag_names: Vec<&str> = CodeFlags::NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if !flag_names.is_empty() {
            writeln!(f, "Flags: {}", flag_names.join(" | "))?;
        }

        let instructions: Vec<DecodedInstruction> = self.instructions().collect();
        let mut jump_targets = vec![false; self.code.len() + 1];
        for target in instructions.iter().filter_map(DecodedInstruction::jump_target) {
            if let Some(slot) = jump_targets.get_mut(target) {
                *slot = true;
            }
        }
        for instr in &instructions {
            let location = self.bci_to_range(instr.bci).unwrap_or_default();
            let location = format!(
                "{:>3}:{:<3} - {:>3}:{:<3}",
                location.start.line, location.start.column, location.end.line, location.end.column
            );
            let marker = if jump_targets[instr.bci] { ">>" } else { "" };
            let (arg, meaning) = self.describe(instr);
            let meaning = meaning.map(|m| format!("({m})")).unwrap_or_default();
            let handlers: Vec<String> = self
                .exception_handler_ranges
                .iter()
                .filter(|range| range.handler as usize == instr.bci)
                .map(|range| {
                    format!(
                        "exc handler {} - {}; stack: {}",
                        range.start, range.end, range.stack_depth
                    )
                })
                .collect();
            let handlers = if handlers.is_empty() {
                String::new()
            } else {
                format!("({})", handlers.join(" | "))
            };
            let line = format!(
                "{location:<8} {marker:>2} {:>4} {:<32} {arg:<3}   {meaning:<32} {handlers}",
                instr.bci,
                instr.opcode.name(),
            );
            writeln!(f, "{}", line.trim_end())?;
        }

        for nested in self.nested_units() {
            writeln!(f)?;
            nested.write_disassembly(f)?;
        }
        Ok(())
    }
}

/// Formats an operand with a leading space for non-negative values.
fn format_arg(arg: i32) -> String {
    if arg < 0 { arg.to_string() } else { format!(" {arg}") }
}

impl fmt::Display for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_disassembly(f)
    }
}
