//! Block-structured intermediate form built by the compiler and consumed by
//! the assembler.
//!
//! Blocks live in an arena (`BlockArena`) and refer to each other by
//! [`BlockId`]. Each block records the block that follows it in emission
//! order; jumps record their target block and are only resolved to byte
//! distances during assembly.

use smallvec::SmallVec;

use super::op::Opcode;
use crate::location::CodeRange;

/// Index of a block in its unit's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// The entry block every unit starts with.
    pub const ENTRY: Self = Self(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A real instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: i32,
    /// Operand bytes after the immediate, see `Opcode::following_arg_length`.
    pub following: SmallVec<[u8; 1]>,
    pub target: Option<BlockId>,
    pub range: CodeRange,
}

impl Instruction {
    #[must_use]
    pub fn new(opcode: Opcode, arg: i32, range: CodeRange) -> Self {
        Self {
            opcode,
            arg,
            following: SmallVec::new(),
            target: None,
            range,
        }
    }

    /// Number of `ExtendedArg` prefixes needed to encode the immediate.
    ///
    /// Jumps encode their distance inline and take no prefixes.
    #[must_use]
    pub fn extended_arg_count(&self) -> usize {
        if self.opcode.is_jump() || self.opcode.arg_length() == 0 || self.opcode == Opcode::LoadByte {
            return 0;
        }
        match self.arg {
            ..=0xff => 0,
            0x100..=0xffff => 1,
            0x1_0000..=0xff_ffff => 2,
            _ => 3,
        }
    }

    /// Encoded size in bytes, including prefixes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.extended_arg_count() * Opcode::ExtendedArg.length() + self.opcode.length()
    }

    /// Stack effect on the fallthrough (`jump == false`) or taken edge.
    #[must_use]
    pub fn stack_effect(&self, jump: bool) -> i32 {
        self.opcode.stack_effect(self.arg, &self.following, jump)
    }
}

/// Zero-length pseudo instructions delimiting exception handler ranges.
///
/// A `Setup*` marker opens a protected range whose handler is `handler`; the
/// matching `Pop*` marker closes the innermost open range, which must be of the
/// same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Opens a range whose handler inspects the exception (`except` clauses, `with` exits).
    SetupExcept(BlockId),
    /// Opens a range whose handler only cleans up and re-raises.
    SetupFinally(BlockId),
    PopExcept,
    PopFinally,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Op(Instruction),
    Marker(Marker),
}

/// A straight-line run of instructions.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub instrs: Vec<Instr>,
    /// The block emitted after this one.
    pub next: Option<BlockId>,
    /// For handler blocks: how many extra stack slots the unwinder discards
    /// below the range's depth before pushing the exception.
    pub unwind_offset: i32,
}

impl Block {
    /// Real instructions, markers skipped.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instrs.iter().filter_map(|instr| match instr {
            Instr::Op(op) => Some(op),
            Instr::Marker(_) => None,
        })
    }

    /// The last real instruction, if any.
    #[must_use]
    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions().last()
    }

    /// Whether control can fall off the end into `next`.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        self.last_instruction().is_none_or(|instr| !instr.opcode.is_unconditional())
    }
}

/// Arena owning all blocks of one compilation unit.
#[derive(Debug, Clone)]
pub struct BlockArena {
    blocks: Vec<Block>,
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockArena {
    /// Creates an arena holding only the entry block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::default()],
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(u32::try_from(self.blocks.len()).expect("block count exceeds u32"));
        self.blocks.push(Block::default());
        id
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block ids in emission order, following `next` from the entry block.
    #[must_use]
    pub fn emission_order(&self) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut current = Some(BlockId::ENTRY);
        while let Some(id) = current {
            order.push(id);
            current = self.get(id).next;
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_args_follow_operand_magnitude() {
        let range = CodeRange::default();
        assert_eq!(Instruction::new(Opcode::LoadFast, 255, range).size(), 2);
        assert_eq!(Instruction::new(Opcode::LoadFast, 256, range).size(), 4);
        assert_eq!(Instruction::new(Opcode::LoadConst, 0x1_0000, range).size(), 6);
        assert_eq!(Instruction::new(Opcode::LoadByte, -1, range).size(), 2);
        assert_eq!(Instruction::new(Opcode::PopTop, 0, range).size(), 1);
    }

    #[test]
    fn emission_order_follows_next_links() {
        let mut arena = BlockArena::new();
        let a = arena.new_block();
        let b = arena.new_block();
        arena.get_mut(BlockId::ENTRY).next = Some(b);
        arena.get_mut(b).next = Some(a);
        assert_eq!(arena.emission_order(), [BlockId::ENTRY, b, a]);
    }

    #[test]
    fn empty_block_falls_through() {
        let mut block = Block::default();
        assert!(block.falls_through());
        block
            .instrs
            .push(Instr::Op(Instruction::new(Opcode::ReturnValue, 0, CodeRange::default())));
        assert!(!block.falls_through());
    }
}
