//! Linearizes a finished [`CompilationUnit`] into a [`CodeUnit`].
//!
//! Assembly runs in a fixed sequence:
//!
//! 1. close any open handler regions and append an implicit `return None`
//! 2. compute the entry stack depth of every reachable block; the rest are
//!    dropped from the output
//! 3. lay out the code assuming short jumps, then upgrade the jumps that may
//!    not fit in one byte (once, using a worst-case bound)
//! 4. emit bytes, the source map and the exception handler table
//!
//! Inconsistent stack depths and unbalanced region markers are emitter bugs and
//! panic; a jump too long even for the far encoding is a resource-limit error.

use std::collections::VecDeque;

use super::{
    builder::{BlockArena, BlockId, Instr, Instruction, Marker},
    code::{CodeFlags, CodeUnit, HandlerRange},
    op::Opcode,
    source_map::SourceMapBuilder,
    unit::{CompilationUnit, RegionKind},
};
use crate::error::CompileError;

/// Largest distance a short jump can encode.
const SHORT_JUMP_MAX: usize = u8::MAX as usize;

/// Assembles `unit` into its final form.
pub(crate) fn assemble(mut unit: CompilationUnit<'_>, filename: &str) -> Result<CodeUnit, CompileError> {
    unit.close_regions();
    add_implicit_return(&mut unit);

    let levels = StackLevels::compute(&unit.blocks);
    let order = unit.blocks.emission_order();
    // unreachable blocks emit no code; their region markers are still replayed
    let live: Vec<BlockId> = order.iter().copied().filter(|&id| levels.get(id).is_some()).collect();
    let ops = flatten(&unit.blocks, &live);
    let far = choose_far_jumps(&ops, &live, unit.blocks.len(), &unit.qualname);
    let layout = Layout::new(&ops, &far, &live, unit.blocks.len());

    let mut emitter = Emitter {
        code: Vec::with_capacity(layout.code_len),
        source_map: SourceMapBuilder::new(unit.range.start),
        quicken_at: Vec::new(),
        ranges: Vec::new(),
    };
    emitter.emit_blocks(&unit.blocks, &order, &levels, &layout, &far)?;
    let Emitter {
        code,
        source_map,
        quicken_at,
        mut ranges,
    } = emitter;
    ranges.sort_by_key(|range| range.start);

    let mut output_can_quicken = vec![0u8; code.len()];
    for bci in quicken_at {
        output_can_quicken[bci] = 1;
    }

    let mut flags = unit.flags;
    if unit.cellvars.is_empty() && unit.freevars.is_empty() {
        flags |= CodeFlags::NOFREE;
    }
    let stack_size = u32::try_from(levels.max_depth).expect("stack depth is non-negative");
    tracing::debug!(
        qualname = %unit.qualname,
        code_size = code.len(),
        stack_size,
        handlers = ranges.len(),
        "assembled code unit"
    );

    Ok(CodeUnit {
        kind: unit.kind,
        name: unit.name,
        qualname: unit.qualname,
        filename: filename.to_owned(),
        flags,
        argcount: unit.argcount,
        posonlyargcount: unit.posonlyargcount,
        kwonlyargcount: unit.kwonlyargcount,
        code,
        srcoffset_table: source_map.finish(),
        exception_handler_ranges: ranges,
        stack_size,
        names: unit.names.into_iter().collect(),
        varnames: unit.varnames.into_iter().collect(),
        cellvars: unit.cellvars.into_iter().collect(),
        freevars: unit.freevars.into_iter().collect(),
        cell2arg: unit.cell2arg,
        constants: unit.constants,
        primitive_constants: unit.primitive_constants.into_iter().collect(),
        output_can_quicken,
        start_line: unit.range.start.line,
        start_column: unit.range.start.column,
        end_line: unit.range.end.line,
        end_column: unit.range.end.column,
        source_map: Default::default(),
    })
}

/// Appends `LOAD_NONE; RETURN_VALUE` unless the last emitted block already returns.
fn add_implicit_return(unit: &mut CompilationUnit<'_>) {
    let returns = unit
        .blocks
        .get(unit.current)
        .last_instruction()
        .is_some_and(|instr| instr.opcode == Opcode::ReturnValue);
    if !returns {
        unit.emit(Opcode::LoadNone, 0, Default::default(), None);
        unit.emit(Opcode::ReturnValue, 0, Default::default(), None);
    }
}

/// Entry stack depth of every block, `None` for unreachable ones.
struct StackLevels {
    levels: Vec<Option<i32>>,
    max_depth: i32,
}

impl StackLevels {
    fn compute(blocks: &BlockArena) -> Self {
        let mut this = Self {
            levels: vec![None; blocks.len()],
            max_depth: 0,
        };
        let mut worklist = VecDeque::new();
        this.merge(BlockId::ENTRY, 0, &mut worklist);

        while let Some(id) = worklist.pop_front() {
            let block = blocks.get(id);
            let mut depth = this.levels[id.index()].expect("queued blocks have a level");
            let mut falls_through = true;
            for instr in &block.instrs {
                let instr = match instr {
                    Instr::Marker(Marker::SetupExcept(handler) | Marker::SetupFinally(handler)) => {
                        let level = depth + blocks.get(*handler).unwind_offset + 1;
                        this.merge(*handler, level, &mut worklist);
                        continue;
                    }
                    Instr::Marker(_) => continue,
                    Instr::Op(instr) => instr,
                };
                if instr.opcode == Opcode::ReturnValue {
                    assert_eq!(depth, 1, "return with stack depth {depth} in block {id:?}");
                }
                if let Some(target) = instr.target {
                    let taken = depth + instr.stack_effect(true);
                    this.merge(target, taken, &mut worklist);
                }
                depth += instr.stack_effect(false);
                assert!(depth >= 0, "negative stack depth after {:?} in block {id:?}", instr.opcode);
                this.max_depth = this.max_depth.max(depth);
                if instr.opcode.is_unconditional() {
                    falls_through = false;
                    break;
                }
            }
            if falls_through && let Some(next) = block.next {
                this.merge(next, depth, &mut worklist);
            }
        }
        this
    }

    fn merge(&mut self, id: BlockId, level: i32, worklist: &mut VecDeque<BlockId>) {
        assert!(level >= 0, "negative stack depth {level} entering block {id:?}");
        self.max_depth = self.max_depth.max(level);
        match self.levels[id.index()] {
            None => {
                self.levels[id.index()] = Some(level);
                worklist.push_back(id);
            }
            Some(existing) => assert_eq!(
                existing, level,
                "stack depth mismatch entering block {id:?}: {existing} vs {level}"
            ),
        }
    }

    fn get(&self, id: BlockId) -> Option<i32> {
        self.levels[id.index()]
    }
}

/// A real instruction in emission order.
struct FlatOp<'a> {
    block: BlockId,
    instr: &'a Instruction,
}

fn flatten<'a>(blocks: &'a BlockArena, order: &[BlockId]) -> Vec<FlatOp<'a>> {
    order
        .iter()
        .flat_map(|&block| blocks.get(block).instructions().map(move |instr| FlatOp { block, instr }))
        .collect()
}

/// Byte offsets of every instruction and block for a given choice of jump widths.
struct Layout {
    op_bci: Vec<usize>,
    block_bci: Vec<usize>,
    /// Index of the first instruction at or after each block's start.
    block_first_op: Vec<usize>,
    code_len: usize,
}

impl Layout {
    fn new(ops: &[FlatOp<'_>], far: &[bool], order: &[BlockId], block_count: usize) -> Self {
        let mut op_bci = Vec::with_capacity(ops.len());
        let mut block_bci = vec![0; block_count];
        let mut block_first_op = vec![0; block_count];
        let mut bci = 0;
        let mut next_op = 0;
        for &block in order {
            block_bci[block.index()] = bci;
            block_first_op[block.index()] = next_op;
            while next_op < ops.len() && ops[next_op].block == block {
                op_bci.push(bci);
                bci += encoded_size(ops[next_op].instr, far[next_op]);
                next_op += 1;
            }
        }
        Self {
            op_bci,
            block_bci,
            block_first_op,
            code_len: bci,
        }
    }

    /// Distance from the jump at `index` to its target block.
    fn distance(&self, index: usize, target: BlockId) -> usize {
        self.op_bci[index].abs_diff(self.block_bci[target.index()])
    }
}

fn encoded_size(instr: &Instruction, far: bool) -> usize {
    if instr.opcode.is_jump() {
        if far {
            instr.opcode.far_form().length()
        } else {
            instr.opcode.short_form().length()
        }
    } else {
        instr.size()
    }
}

/// Decides, in one pass, which jumps need the two-byte encoding.
///
/// Each jump inside a span can grow by at most one byte, so a jump whose
/// short-layout distance plus the number of other jumps it spans fits in one
/// byte is guaranteed to still fit after the others are upgraded.
///
/// This over-approximates: a jump near the boundary that spans other jumps can
/// come out far even though its final distance would fit in one byte, because
/// the spanned jumps may stay short.
fn choose_far_jumps(ops: &[FlatOp<'_>], order: &[BlockId], block_count: usize, qualname: &str) -> Vec<bool> {
    let short = vec![false; ops.len()];
    let layout = Layout::new(ops, &short, order, block_count);
    // jumps_before[i] = number of jumps among ops[..i]
    let mut jumps_before = Vec::with_capacity(ops.len() + 1);
    jumps_before.push(0usize);
    for op in ops {
        let last = *jumps_before.last().unwrap_or(&0);
        jumps_before.push(last + usize::from(op.instr.opcode.is_jump()));
    }

    ops.iter()
        .enumerate()
        .map(|(index, op)| {
            let Some(target) = op.instr.target.filter(|_| op.instr.opcode.is_jump()) else {
                return false;
            };
            let target_op = layout.block_first_op[target.index()];
            let spanned = if target_op > index {
                jumps_before[target_op] - jumps_before[index + 1]
            } else {
                jumps_before[index] - jumps_before[target_op]
            };
            let distance = layout.distance(index, target);
            let far = distance + spanned > SHORT_JUMP_MAX;
            if far {
                tracing::trace!(
                    qualname,
                    opcode = op.instr.opcode.name(),
                    distance,
                    spanned,
                    "upgrading jump to far form"
                );
            }
            far
        })
        .collect()
}

/// Output buffers of the final pass.
struct Emitter {
    code: Vec<u8>,
    source_map: SourceMapBuilder,
    quicken_at: Vec<usize>,
    ranges: Vec<HandlerRange>,
}

impl Emitter {
    fn emit_blocks(
        &mut self,
        blocks: &BlockArena,
        order: &[BlockId],
        levels: &StackLevels,
        layout: &Layout,
        far: &[bool],
    ) -> Result<(), CompileError> {
        let mut open: Vec<(BlockId, RegionKind, usize)> = Vec::new();
        let mut op_index = 0;
        for &id in order {
            let block = blocks.get(id);
            let mut depth = levels.get(id);
            let live = depth.is_some();
            for instr in &block.instrs {
                let bci = self.code.len();
                let instr = match instr {
                    Instr::Marker(Marker::SetupExcept(handler)) => {
                        open.push((*handler, RegionKind::Except, bci));
                        continue;
                    }
                    Instr::Marker(Marker::SetupFinally(handler)) => {
                        open.push((*handler, RegionKind::Finally, bci));
                        continue;
                    }
                    Instr::Marker(Marker::PopExcept) => {
                        self.close_range(&mut open, RegionKind::Except, bci, levels, layout);
                        continue;
                    }
                    Instr::Marker(Marker::PopFinally) => {
                        self.close_range(&mut open, RegionKind::Finally, bci, levels, layout);
                        continue;
                    }
                    Instr::Op(_) if !live => continue,
                    Instr::Op(instr) => instr,
                };
                debug_assert_eq!(bci, layout.op_bci[op_index]);

                if let Some(current) = depth {
                    if let Some(target) = instr.target {
                        assert_eq!(
                            levels.get(target),
                            Some(current + instr.stack_effect(true)),
                            "jump target {target:?} entered at an inconsistent depth"
                        );
                    }
                    depth = Some(current + instr.stack_effect(false));
                }
                if instr.opcode.is_unconditional() {
                    depth = None;
                }

                if let Some(target) = instr.target.filter(|_| instr.opcode.is_jump()) {
                    self.emit_jump(instr, far[op_index], layout.distance(op_index, target))?;
                } else {
                    self.emit_instruction(instr);
                }
                op_index += 1;
            }
            if let (Some(current), Some(next)) = (depth, block.next) {
                assert_eq!(
                    levels.get(next),
                    Some(current),
                    "fallthrough into {next:?} at an inconsistent depth"
                );
            }
        }
        assert!(open.is_empty(), "handler regions left open at end of unit: {open:?}");
        Ok(())
    }

    fn close_range(
        &mut self,
        open: &mut Vec<(BlockId, RegionKind, usize)>,
        kind: RegionKind,
        end: usize,
        levels: &StackLevels,
        layout: &Layout,
    ) {
        let (handler, open_kind, start) = open.pop().expect("region pop without a matching setup");
        assert_eq!(open_kind, kind, "region closed with the wrong kind");
        let Some(level) = levels.get(handler) else {
            // the region's code is unreachable
            return;
        };
        if start == end {
            return;
        }
        self.ranges.push(HandlerRange {
            start: to_u32(start),
            end: to_u32(end),
            handler: to_u32(layout.block_bci[handler.index()]),
            stack_depth: u32::try_from(level - 1).expect("handler entry depth is at least 1"),
        });
    }

    fn emit_jump(&mut self, instr: &Instruction, far: bool, distance: usize) -> Result<(), CompileError> {
        self.source_map.push(instr.range);
        if instr.opcode.short_form().can_quicken() {
            self.quicken_at.push(self.code.len());
        }
        if far {
            let distance = u16::try_from(distance)
                .map_err(|_| CompileError::resource_limit("jump distance too large", instr.range))?;
            self.code.push(instr.opcode.far_form() as u8);
            self.code.extend_from_slice(&distance.to_le_bytes());
        } else {
            let distance = u8::try_from(distance).expect("short jump distance was bounded during layout");
            self.code.push(instr.opcode.short_form() as u8);
            self.code.push(distance);
        }
        Ok(())
    }

    fn emit_instruction(&mut self, instr: &Instruction) {
        let bytes = instr.arg.to_le_bytes();
        for i in (1..=instr.extended_arg_count()).rev() {
            self.source_map.push(instr.range);
            self.code.push(Opcode::ExtendedArg as u8);
            self.code.push(bytes[i]);
        }
        self.source_map.push(instr.range);
        if instr.opcode.can_quicken() {
            self.quicken_at.push(self.code.len());
        }
        self.code.push(instr.opcode as u8);
        let opcode = instr.opcode;
        if opcode.arg_length() > opcode.following_arg_length() {
            self.code.push(bytes[0]);
        }
        for i in 0..opcode.following_arg_length() {
            self.code.push(instr.following.get(i).copied().unwrap_or(0));
        }
    }
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).expect("bytecode offset exceeds u32")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::ScopeId,
        bytecode::{code::UnitKind, source_map::decode_ranges},
        location::{CodeLoc, CodeRange},
        parse::parse,
        scope::ScopeAnalysis,
        CompileOptions,
    };

    fn analysis() -> ScopeAnalysis {
        ScopeAnalysis::analyze(&parse("pass", &CompileOptions::new()).unwrap()).unwrap()
    }

    fn new_unit(scopes: &ScopeAnalysis) -> CompilationUnit<'_> {
        CompilationUnit::new(
            UnitKind::Module,
            scopes.scope(ScopeId::MODULE),
            "<module>".to_owned(),
            "<module>".to_owned(),
            CodeRange::default(),
        )
    }

    /// A conditional jump over `padding` one-byte `NOP`s, then `return None`.
    fn jump_over(padding: usize) -> CodeUnit {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        let filler = unit.new_block();
        let target = unit.new_block();
        unit.emit(Opcode::LoadTrue, 0, Default::default(), None);
        unit.emit(Opcode::PopAndJumpIfFalse, 0, Default::default(), Some(target));
        unit.use_next_block(filler);
        for _ in 0..padding {
            unit.emit(Opcode::Nop, 0, Default::default(), None);
        }
        unit.use_next_block(target);
        assemble(unit, "<test>").unwrap()
    }

    #[test]
    fn jump_of_255_bytes_stays_short() {
        let code = jump_over(253);
        let jump = code.instructions().nth(1).unwrap();
        assert_eq!(jump.opcode, Opcode::PopAndJumpIfFalse);
        assert_eq!(jump.jump_target(), Some(256));
        assert_eq!(code.code[256], Opcode::LoadNone as u8);
    }

    #[test]
    fn jump_of_256_bytes_goes_far() {
        let code = jump_over(254);
        let jump = code.instructions().nth(1).unwrap();
        assert_eq!(jump.opcode, Opcode::PopAndJumpIfFalseFar);
        // the far form is one byte longer, which moves the target as well
        assert_eq!(jump.jump_target(), Some(258));
        assert_eq!(code.code[258], Opcode::LoadNone as u8);
    }

    /// The outer jump's short distance is 255, which would fit, but it spans a
    /// jump that could have grown, so it is upgraded anyway.
    #[test]
    fn jump_spanning_another_jump_goes_far_at_the_boundary() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        let inner = unit.new_block();
        let filler = unit.new_block();
        let target = unit.new_block();
        unit.emit(Opcode::LoadTrue, 0, Default::default(), None);
        unit.emit(Opcode::PopAndJumpIfFalse, 0, Default::default(), Some(target));
        unit.use_next_block(inner);
        unit.emit(Opcode::LoadTrue, 0, Default::default(), None);
        unit.emit(Opcode::PopAndJumpIfFalse, 0, Default::default(), Some(filler));
        unit.use_next_block(filler);
        for _ in 0..250 {
            unit.emit(Opcode::Nop, 0, Default::default(), None);
        }
        unit.use_next_block(target);
        let code = assemble(unit, "<test>").unwrap();

        let jumps: Vec<_> = code.instructions().filter(|instr| instr.opcode.is_jump()).collect();
        assert_eq!(jumps[0].opcode, Opcode::PopAndJumpIfFalseFar);
        assert_eq!(jumps[0].jump_target(), Some(257));
        assert_eq!(jumps[1].opcode, Opcode::PopAndJumpIfFalse);
        assert_eq!(jumps[1].jump_target(), Some(7));
        assert_eq!(code.code[257], Opcode::LoadNone as u8);
    }

    #[test]
    fn implicit_return_is_appended_once() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        unit.emit(Opcode::LoadTrue, 0, Default::default(), None);
        unit.emit(Opcode::ReturnValue, 0, Default::default(), None);
        let code = assemble(unit, "<test>").unwrap();
        assert_eq!(code.code, [Opcode::LoadTrue as u8, Opcode::ReturnValue as u8]);
        assert_eq!(code.stack_size, 1);
        assert_eq!(code.output_can_quicken, [1, 0]);
    }

    #[test]
    fn extended_args_precede_wide_operands() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        unit.emit(Opcode::LoadConst, 0x1234, Default::default(), None);
        unit.emit(Opcode::PopTop, 0, Default::default(), None);
        let code = assemble(unit, "<test>").unwrap();
        assert_eq!(
            &code.code[..4],
            [Opcode::ExtendedArg as u8, 0x12, Opcode::LoadConst as u8, 0x34]
        );
        let decoded: Vec<_> = code.instructions().collect();
        assert_eq!(decoded[1].arg, 0x1234);
    }

    #[test]
    #[should_panic(expected = "negative stack depth")]
    fn negative_depth_panics() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        unit.emit(Opcode::PopTop, 0, Default::default(), None);
        let _ = assemble(unit, "<test>");
    }

    /// Every setup of a region is an edge into its handler, so re-opening the
    /// region at another depth is a mismatch like any other merge.
    #[test]
    #[should_panic(expected = "stack depth mismatch entering block")]
    fn reopened_region_at_other_depth_panics() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        let handler = unit.new_block();
        let body = unit.new_block();
        let between = unit.new_block();
        let reopened = unit.new_block();
        let after = unit.new_block();
        unit.push_frame(super::super::unit::FrameBlock::TryExcept { handler });
        unit.use_next_block(body);
        unit.emit(Opcode::LoadNone, 0, Default::default(), None);
        unit.pop_frame();
        unit.use_next_block(between);
        unit.push_frame(super::super::unit::FrameBlock::TryExcept { handler });
        unit.use_next_block(reopened);
        unit.emit(Opcode::PopTop, 0, Default::default(), None);
        unit.pop_frame();
        unit.use_next_block(after);
        unit.emit(Opcode::LoadNone, 0, Default::default(), None);
        unit.emit(Opcode::ReturnValue, 0, Default::default(), None);
        unit.use_next_block(handler);
        unit.emit(Opcode::PopTop, 0, Default::default(), None);
        unit.emit(Opcode::LoadNone, 0, Default::default(), None);
        unit.emit(Opcode::ReturnValue, 0, Default::default(), None);
        let _ = assemble(unit, "<test>");
    }

    #[test]
    fn unreachable_region_is_dropped() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        let handler = unit.new_block();
        let dead = unit.new_block();
        unit.emit(Opcode::LoadNone, 0, Default::default(), None);
        unit.emit(Opcode::ReturnValue, 0, Default::default(), None);
        unit.push_frame(super::super::unit::FrameBlock::TryExcept { handler });
        unit.use_next_block(dead);
        unit.emit(Opcode::LoadNone, 0, Default::default(), None);
        unit.emit(Opcode::PopTop, 0, Default::default(), None);
        unit.pop_frame();
        unit.use_next_block(handler);
        unit.emit(Opcode::EndExcHandler, 0, Default::default(), None);
        let code = assemble(unit, "<test>").unwrap();
        assert!(code.exception_handler_ranges.is_empty());
        assert_eq!(code.code, [Opcode::LoadNone as u8, Opcode::ReturnValue as u8]);
    }

    #[test]
    fn code_after_return_is_not_emitted() {
        let scopes = analysis();
        let mut unit = new_unit(&scopes);
        let dead = unit.new_block();
        unit.emit(Opcode::LoadTrue, 0, Default::default(), None);
        unit.emit(Opcode::ReturnValue, 0, Default::default(), None);
        unit.use_next_block(dead);
        unit.emit(Opcode::LoadFalse, 0, Default::default(), None);
        unit.emit(Opcode::PopTop, 0, Default::default(), None);
        let code = assemble(unit, "<test>").unwrap();
        assert_eq!(code.code, [Opcode::LoadTrue as u8, Opcode::ReturnValue as u8]);
        assert_eq!(decode_ranges(&code.srcoffset_table, CodeLoc::default()).len(), 2);
    }
}
