//! Legality of jumps set by a debugger.
//!
//! Moving the instruction pointer of a suspended frame is only safe when the
//! value stack at the destination is what the code there expects. This module
//! computes, for every reachable bci, a coarse description of the value stack
//! ([`StackItem`]s, bottom first) and compares the descriptions at both ends of
//! a proposed jump.
//!
//! A jump is accepted when the destination stack is a bottom-aligned prefix of
//! the source stack and the items that would be dropped hold no context
//! manager and no saved exception state. Dropping a for-loop iterator is fine.

use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use super::code::{CodeUnit, DecodedInstruction, LineLookup};
use super::op::Opcode;

/// What a value stack slot holds, as far as jumps are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackItem {
    /// The `__exit__` of an active `with` statement.
    With,
    /// The iterator of an active `for` loop.
    Iterable,
    /// Saved or in-flight exception state.
    Except,
    /// Any other value.
    Object,
}

impl StackItem {
    /// The construct the item belongs to, as named in "can't jump into" messages.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::With => "the body of a with statement",
            Self::Iterable => "the body of a for loop",
            Self::Except => "an 'except' block as there's no exception",
            Self::Object => "Incompatible stack",
        }
    }

    fn exit_description(self) -> &'static str {
        match self {
            Self::With => "the body of a with statement",
            Self::Except => "an 'except' block",
            other => other.description(),
        }
    }
}

impl fmt::Display for StackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Reason a jump was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JumpError {
    #[error("can't jump into {0}")]
    Into(StackItem),
    #[error("can't jump out of {}", .0.exit_description())]
    OutOf(StackItem),
    #[error("Incompatible stack")]
    Incompatible,
    #[error("line {line} comes before the current code block")]
    BeforeCode { line: u32 },
    #[error("line {line} comes after the current code block")]
    AfterCode { line: u32 },
    #[error("bci {0} is not reachable")]
    Unreachable(usize),
}

type Stack = SmallVec<[StackItem; 8]>;

/// Stack descriptions for every reachable bci of one code unit.
#[derive(Debug, Clone)]
pub struct JumpAnalysis {
    /// Indexed by bci; `None` for unreachable bcis and operand bytes.
    stacks: Vec<Option<Stack>>,
}

impl JumpAnalysis {
    /// Runs the stack analysis over `code`.
    #[must_use]
    pub fn new(code: &CodeUnit) -> Self {
        let instructions: Vec<DecodedInstruction> = code.instructions().collect();
        let mut by_bci = vec![None; code.code.len() + 1];
        for (i, instr) in instructions.iter().enumerate() {
            by_bci[instr.bci] = Some(i);
        }
        let handler_entries: Vec<usize> = code
            .exception_handler_ranges
            .iter()
            .map(|range| range.handler as usize)
            .collect();

        let mut analysis = Worklist {
            stacks: vec![None; code.code.len() + 1],
            todo: Vec::new(),
        };
        analysis.set(0, Stack::new());
        while let Some(bci) = analysis.todo.pop() {
            let Some(index) = by_bci.get(bci).copied().flatten() else {
                continue;
            };
            let instr = &instructions[index];
            let stack = analysis.stacks[bci].clone().expect("queued bcis have a stack");

            for range in &code.exception_handler_ranges {
                if range.start as usize == bci {
                    let depth = (range.stack_depth as usize).min(stack.len());
                    let mut handler_stack: Stack = stack[..depth].iter().copied().collect();
                    handler_stack.push(StackItem::Except);
                    analysis.set(range.handler as usize, handler_stack);
                }
            }

            let next = instr.next_bci();
            // the handler's stack takes precedence over normal flow reaching its entry
            let fallthrough = |analysis: &mut Worklist, stack: Stack| {
                if !handler_entries.contains(&next) {
                    analysis.set(next, stack);
                }
            };
            match instr.opcode.short_form() {
                Opcode::GetIter => {
                    let mut next_stack = stack;
                    next_stack.pop();
                    next_stack.push(StackItem::Iterable);
                    fallthrough(&mut analysis, next_stack);
                }
                Opcode::ForIter => {
                    let mut exhausted = stack.clone();
                    exhausted.pop();
                    if let Some(target) = instr.jump_target() {
                        analysis.set(target, exhausted);
                    }
                    let mut next_stack = stack;
                    next_stack.push(StackItem::Object);
                    fallthrough(&mut analysis, next_stack);
                }
                Opcode::PushExcInfo => {
                    let mut next_stack = stack;
                    let top = next_stack.pop().unwrap_or(StackItem::Object);
                    next_stack.push(StackItem::Except);
                    next_stack.push(top);
                    fallthrough(&mut analysis, next_stack);
                }
                Opcode::SetupWith => {
                    let mut next_stack = stack;
                    next_stack.push(StackItem::With);
                    next_stack.push(StackItem::Object);
                    fallthrough(&mut analysis, next_stack);
                }
                Opcode::DupTop => {
                    let mut next_stack = stack;
                    let top = next_stack.last().copied().unwrap_or(StackItem::Object);
                    next_stack.push(top);
                    fallthrough(&mut analysis, next_stack);
                }
                Opcode::RotTwo => {
                    let mut next_stack = stack;
                    let len = next_stack.len();
                    if len >= 2 {
                        next_stack.swap(len - 1, len - 2);
                    }
                    fallthrough(&mut analysis, next_stack);
                }
                Opcode::RotThree => {
                    let mut next_stack = stack;
                    let len = next_stack.len();
                    if len >= 3 {
                        next_stack[len - 3..].rotate_right(1);
                    }
                    fallthrough(&mut analysis, next_stack);
                }
                opcode => {
                    if let Some(target) = instr.jump_target() {
                        analysis.set(target, apply_effect(&stack, instr.stack_effect(true)));
                    }
                    if !opcode.is_unconditional() {
                        fallthrough(&mut analysis, apply_effect(&stack, instr.stack_effect(false)));
                    }
                }
            }
        }
        Self {
            stacks: analysis.stacks,
        }
    }

    /// The stack description at `bci`, or `None` if it is never reached.
    #[must_use]
    pub fn stack_at(&self, bci: usize) -> Option<&[StackItem]> {
        self.stacks.get(bci)?.as_deref()
    }

    /// Checks a jump from the instruction at `from` to the one at `to`.
    ///
    /// # Errors
    /// Returns the reason the jump would corrupt the value stack.
    pub fn check(&self, from: usize, to: usize) -> Result<(), JumpError> {
        let from_stack = self.stack_at(from).ok_or(JumpError::Unreachable(from))?;
        let to_stack = self.stack_at(to).ok_or(JumpError::Unreachable(to))?;
        if to_stack.len() > from_stack.len() {
            return Err(blocked_by(to_stack[to_stack.len() - 1]));
        }
        for (i, (to_item, from_item)) in to_stack.iter().zip(from_stack).enumerate().rev() {
            if to_item != from_item {
                return Err(blocked_by(to_stack[i]));
            }
        }
        if let Some(item) = from_stack[to_stack.len()..]
            .iter()
            .rev()
            .find(|item| matches!(item, StackItem::With | StackItem::Except))
        {
            return Err(JumpError::OutOf(*item));
        }
        Ok(())
    }
}

fn blocked_by(item: StackItem) -> JumpError {
    match item {
        StackItem::Object => JumpError::Incompatible,
        other => JumpError::Into(other),
    }
}

fn apply_effect(stack: &Stack, effect: i32) -> Stack {
    let mut next = stack.clone();
    if effect < 0 {
        let keep = next.len().saturating_sub(effect.unsigned_abs() as usize);
        next.truncate(keep);
    } else {
        next.extend(std::iter::repeat_n(StackItem::Object, effect.unsigned_abs() as usize));
    }
    next
}

struct Worklist {
    stacks: Vec<Option<Stack>>,
    todo: Vec<usize>,
}

impl Worklist {
    /// Records the stack reaching `bci`. The first path to reach a bci wins.
    fn set(&mut self, bci: usize, stack: Stack) {
        if let Some(slot) = self.stacks.get_mut(bci)
            && slot.is_none()
        {
            *slot = Some(stack);
            self.todo.push(bci);
        }
    }
}

/// Checks a jump between two instruction offsets of `code`.
///
/// # Errors
/// See [`JumpAnalysis::check`].
pub fn check_jump(code: &CodeUnit, from: usize, to: usize) -> Result<(), JumpError> {
    JumpAnalysis::new(code).check(from, to)
}

/// Checks a jump from `from_bci` to the first instruction of `to_line` (or the
/// nearest line after it) and returns the destination bci.
///
/// # Errors
/// Returns `BeforeCode`/`AfterCode` when the line is outside the unit, or the
/// reason the jump is illegal.
pub fn check_line_jump(code: &CodeUnit, from_bci: usize, to_line: u32) -> Result<usize, JumpError> {
    let to = match code.line_to_bci(to_line) {
        LineLookup::Bci(bci) => bci,
        LineLookup::BeforeCode => return Err(JumpError::BeforeCode { line: to_line }),
        LineLookup::AfterCode => return Err(JumpError::AfterCode { line: to_line }),
    };
    check_jump(code, from_bci, to)?;
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(items: &[StackItem]) -> Stack {
        items.iter().copied().collect()
    }

    #[test]
    fn effects_pop_and_push_objects() {
        let base = stack(&[StackItem::Iterable, StackItem::Object]);
        assert_eq!(apply_effect(&base, -1).as_slice(), &[StackItem::Iterable]);
        assert_eq!(
            apply_effect(&base, 2).as_slice(),
            &[
                StackItem::Iterable,
                StackItem::Object,
                StackItem::Object,
                StackItem::Object
            ]
        );
    }

    #[test]
    fn messages_name_the_construct() {
        assert_eq!(
            JumpError::Into(StackItem::Iterable).to_string(),
            "can't jump into the body of a for loop"
        );
        assert_eq!(
            JumpError::OutOf(StackItem::Except).to_string(),
            "can't jump out of an 'except' block"
        );
        assert_eq!(
            JumpError::AfterCode { line: 9 }.to_string(),
            "line 9 comes after the current code block"
        );
    }
}
