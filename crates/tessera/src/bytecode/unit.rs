//! Per-scope compilation state.
//!
//! A `CompilationUnit` is created when the compiler enters a scope and is
//! consumed by [`super::assemble`] when the scope is finished. It owns the
//! symbol tables, both constant pools, the block arena with the emission cursor,
//! and the stack of frame blocks describing the structured constructs the cursor
//! is currently inside.
//!
//! Exception regions are derived from the frame stack: every time the cursor
//! moves to a new block, the unit compares the regions of the current frame
//! chain with the regions that are open and emits the `Pop*`/`Setup*` markers
//! needed to bring them in line. Region changes therefore only ever happen at
//! block boundaries.

use ahash::AHashMap;
use indexmap::IndexSet;
use num_bigint::BigInt;
use smallvec::SmallVec;

use super::{
    builder::{BlockArena, BlockId, Instr, Instruction, Marker},
    code::{CodeFlags, Constant, UnitKind},
    op::Opcode,
};
use crate::{ast::StmtLoc, location::CodeRange, scope::Scope};

/// A compile-time record of an enclosing structured construct.
///
/// Non-local exits (`break`, `continue`, `return`) walk these innermost first
/// and emit the cleanup each one requires.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FrameBlock<'a> {
    For {
        start: BlockId,
        end: BlockId,
    },
    While {
        start: BlockId,
        end: BlockId,
    },
    /// Body of a `with` item; `handler` runs `EXIT_WITH` for an exception.
    With {
        handler: BlockId,
    },
    /// Body of a `try` with `except` clauses.
    TryExcept {
        handler: BlockId,
    },
    /// Body, handlers and `else` of a `try` with a `finally` clause.
    TryFinally {
        handler: BlockId,
        finalbody: &'a [StmtLoc],
    },
    /// Inside an `except` clause: the saved exception state is on the stack.
    ExceptHandler {
        cleanup: BlockId,
    },
    /// Inside an `except ... as name` body: the name must be deleted on exit.
    HandlerBindingCleanup {
        cleanup: BlockId,
        name: &'a str,
    },
    /// Inside the exception-path copy of a `finally` body.
    FinallyHandler {
        cleanup: BlockId,
    },
    /// A value kept on the stack while a `finally` body runs for a `return`.
    PopValue,
}

/// Whether a region's handler inspects the exception or only cleans up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionKind {
    Except,
    Finally,
}

impl FrameBlock<'_> {
    /// The exception region the frame opens, if any.
    fn region(&self) -> Option<(BlockId, RegionKind)> {
        match *self {
            Self::With { handler } | Self::TryExcept { handler } => Some((handler, RegionKind::Except)),
            Self::TryFinally { handler, .. } => Some((handler, RegionKind::Finally)),
            Self::ExceptHandler { cleanup }
            | Self::HandlerBindingCleanup { cleanup, .. }
            | Self::FinallyHandler { cleanup } => Some((cleanup, RegionKind::Finally)),
            Self::For { .. } | Self::While { .. } | Self::PopValue => None,
        }
    }
}

/// Hashable identity of a deduplicated constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    None,
    Str(String),
    Bytes(Vec<u8>),
    BigInt(BigInt),
    /// Bit patterns, so `0.0` and `-0.0` stay distinct.
    Complex(u64, u64),
    StrArray(Vec<String>),
}

impl ConstKey {
    /// Code constants are never shared and have no key.
    fn of(constant: &Constant) -> Option<Self> {
        Some(match constant {
            Constant::None => Self::None,
            Constant::Str(s) => Self::Str(s.clone()),
            Constant::Bytes(b) => Self::Bytes(b.clone()),
            Constant::BigInt(value) => Self::BigInt(value.clone()),
            Constant::Complex { real, imag } => Self::Complex(real.to_bits(), imag.to_bits()),
            Constant::StrArray(items) => Self::StrArray(items.clone()),
            Constant::Code(_) => return None,
        })
    }
}

/// Compilation state of one scope.
#[derive(Debug)]
pub(crate) struct CompilationUnit<'a> {
    pub kind: UnitKind,
    pub scope: &'a Scope,
    pub name: String,
    pub qualname: String,
    pub flags: u32,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    /// Range of the node the unit was created for.
    pub range: CodeRange,
    /// Range attached to instructions emitted next.
    pub location: CodeRange,

    pub names: IndexSet<String>,
    pub varnames: IndexSet<String>,
    pub cellvars: IndexSet<String>,
    pub freevars: IndexSet<String>,
    pub cell2arg: Vec<Option<u32>>,
    pub constants: Vec<Constant>,
    constant_index: AHashMap<ConstKey, u32>,
    pub primitive_constants: IndexSet<u64>,

    pub blocks: BlockArena,
    pub current: BlockId,
    frames: Vec<FrameBlock<'a>>,
    /// Regions opened by markers emitted so far, outermost first.
    open_regions: Vec<(BlockId, RegionKind)>,
}

impl<'a> CompilationUnit<'a> {
    pub fn new(kind: UnitKind, scope: &'a Scope, name: String, qualname: String, range: CodeRange) -> Self {
        let varnames: IndexSet<String> = scope.params().iter().cloned().collect();
        let cellvars: IndexSet<String> = scope.cellvars().into_iter().map(ToOwned::to_owned).collect();
        let freevars: IndexSet<String> = scope.freevars().into_iter().map(ToOwned::to_owned).collect();
        let cell2arg = cellvars
            .iter()
            .map(|cell| varnames.get_index_of(cell).map(to_u32))
            .collect();
        let flags = if scope.is_function_like() {
            CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS
        } else {
            0
        };
        Self {
            kind,
            scope,
            name,
            qualname,
            flags,
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            range,
            location: range,
            names: IndexSet::new(),
            varnames,
            cellvars,
            freevars,
            cell2arg,
            constants: Vec::new(),
            constant_index: AHashMap::new(),
            primitive_constants: IndexSet::new(),
            blocks: BlockArena::new(),
            current: BlockId::ENTRY,
            frames: Vec::new(),
            open_regions: Vec::new(),
        }
    }

    // === Tables ===

    pub fn name_index(&mut self, name: &str) -> i32 {
        index_in(&mut self.names, name)
    }

    pub fn varname_index(&mut self, name: &str) -> i32 {
        index_in(&mut self.varnames, name)
    }

    pub fn cell_index(&mut self, name: &str) -> i32 {
        index_in(&mut self.cellvars, name)
    }

    /// Index into the combined `cellvars ++ freevars` table.
    pub fn free_index(&mut self, name: &str) -> i32 {
        let cells = to_i32(self.cellvars.len());
        cells + index_in(&mut self.freevars, name)
    }

    /// Adds a constant to the pool, reusing an equal entry when there is one.
    pub fn add_constant(&mut self, constant: Constant) -> i32 {
        let Some(key) = ConstKey::of(&constant) else {
            self.constants.push(constant);
            return to_i32(self.constants.len() - 1);
        };
        let next = to_u32(self.constants.len());
        let index = *self.constant_index.entry(key).or_insert(next);
        if index == next {
            self.constants.push(constant);
        }
        index.cast_signed()
    }

    /// Adds an `i64`/`f64` bit pattern to the primitive pool.
    pub fn add_primitive(&mut self, bits: u64) -> i32 {
        to_i32(self.primitive_constants.insert_full(bits).0)
    }

    // === Emission ===

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.new_block()
    }

    /// Appends an instruction at the cursor.
    pub fn emit(&mut self, opcode: Opcode, arg: i32, following: SmallVec<[u8; 1]>, target: Option<BlockId>) {
        let location = self.location;
        self.blocks.get_mut(self.current).instrs.push(Instr::Op(Instruction {
            opcode,
            arg,
            following,
            target,
            range: location,
        }));
    }

    /// Moves the cursor to `block`, linking it after the current block.
    ///
    /// Emits the region markers that the current frame stack calls for at the
    /// start of `block`.
    pub fn use_next_block(&mut self, block: BlockId) {
        if block == self.current {
            return;
        }
        self.blocks.get_mut(self.current).next = Some(block);
        self.current = block;
        self.sync_regions();
    }

    /// Closes every region still open at the cursor. Called once before assembly.
    pub fn close_regions(&mut self) {
        debug_assert!(self.frames.is_empty(), "frame stack not empty at end of unit");
        self.sync_regions();
    }

    fn sync_regions(&mut self) {
        let wanted: SmallVec<[(BlockId, RegionKind); 8]> = self.frames.iter().filter_map(FrameBlock::region).collect();
        let common = self
            .open_regions
            .iter()
            .zip(&wanted)
            .take_while(|(open, want)| open == want)
            .count();
        let block = self.blocks.get_mut(self.current);
        for &(_, kind) in self.open_regions[common..].iter().rev() {
            block.instrs.push(Instr::Marker(match kind {
                RegionKind::Except => Marker::PopExcept,
                RegionKind::Finally => Marker::PopFinally,
            }));
        }
        for &(handler, kind) in &wanted[common..] {
            block.instrs.push(Instr::Marker(match kind {
                RegionKind::Except => Marker::SetupExcept(handler),
                RegionKind::Finally => Marker::SetupFinally(handler),
            }));
        }
        self.open_regions.truncate(common);
        self.open_regions.extend_from_slice(&wanted[common..]);
    }

    pub fn set_unwind_offset(&mut self, block: BlockId, offset: i32) {
        self.blocks.get_mut(block).unwind_offset = offset;
    }

    // === Frames ===

    pub fn push_frame(&mut self, frame: FrameBlock<'a>) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> FrameBlock<'a> {
        self.frames.pop().expect("frame stack underflow")
    }

    /// The innermost enclosing loop frame, if any.
    pub fn innermost_loop(&self) -> Option<FrameBlock<'a>> {
        self.frames
            .iter()
            .rev()
            .find(|frame| matches!(frame, FrameBlock::For { .. } | FrameBlock::While { .. }))
            .copied()
    }

    /// Takes the frame stack out of the unit so the caller can unwind it.
    pub fn take_frames(&mut self) -> Vec<FrameBlock<'a>> {
        std::mem::take(&mut self.frames)
    }

    /// Puts back a frame stack, or a prefix of one, while unwinding.
    pub fn set_frames(&mut self, frames: Vec<FrameBlock<'a>>) {
        self.frames = frames;
    }
}

fn index_in(set: &mut IndexSet<String>, name: &str) -> i32 {
    let index = match set.get_index_of(name) {
        Some(index) => index,
        None => set.insert_full(name.to_owned()).0,
    };
    to_i32(index)
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).expect("table index exceeds i32")
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).expect("table index exceeds u32")
}
