//! Bytecode generation for Tessera.
//!
//! This module turns an analyzed AST into [`CodeUnit`]s: flat bytecode arrays
//! with their constant pools, exception table and source map.
//!
//! # Module Structure
//!
//! - `op` - Opcode table: operand widths, stack effects, far-jump variants
//! - `builder` - Blocks and instructions before layout
//! - `unit` - Per-scope compilation state and exception region markers
//! - `collector` - Batched construction of collections and argument arrays
//! - `compiler` - AST to block lowering
//! - `assemble` - Stack depths, jump sizing and byte emission
//! - `source_map` - Compact bci to source range table
//! - `code` - The finished code unit and its disassembly
//! - `jump_check` - Legality of debugger-driven jumps

pub use code::{CodeFlags, CodeUnit, Constant, DecodedInstruction, HandlerRange, Instructions, LineLookup, UnitKind};
pub use jump_check::{JumpAnalysis, JumpError, StackItem, check_jump, check_line_jump};
pub use op::{BinaryOp, CollectionBits, MakeFunctionFlags, Opcode, UnaryOp};
pub use source_map::{SourceMap, SourceMapBuilder, decode_ranges};
pub(crate) use compiler::compile_module;

mod assemble;
mod builder;
mod code;
mod collector;
mod compiler;
mod jump_check;
mod op;
mod source_map;
mod unit;
