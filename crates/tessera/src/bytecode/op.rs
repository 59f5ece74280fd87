//! Opcode definitions shared by the compiler, the assembler and every consumer
//! of the finished bytecode.
//!
//! Each instruction is one opcode byte followed by `Opcode::arg_length()`
//! operand bytes. The first operand byte is the low byte of the immediate
//! argument; wider arguments are encoded with `ExtendedArg` prefixes. Opcodes
//! that take a second operand (`CallMethod`, `MakeFunction`, `UnpackEx`) carry
//! it as one "following" byte after the immediate. Far jump variants store
//! their distance inline as a little-endian `u16` and never take prefixes.

use serde::{Deserialize, Serialize};
use strum::{EnumCount, FromRepr, IntoStaticStr};

/// Bytecode opcodes.
///
/// The discriminants are the on-disk encoding; reordering variants changes
/// the output format.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, EnumCount, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // stack manipulation
    Nop,
    PopTop,
    RotTwo,
    RotThree,
    DupTop,

    // operators, argument is a `UnaryOp` / `BinaryOp` discriminant
    UnaryOp,
    BinaryOp,
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,

    GetIter,
    LoadBuildClass,
    LoadAssertionError,
    ReturnValue,

    // names, argument indexes `names`
    LoadName,
    StoreName,
    DeleteName,
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadAttr,
    StoreAttr,
    DeleteAttr,

    // locals, argument indexes `varnames`
    LoadFast,
    StoreFast,
    DeleteFast,

    // cells then frees, argument indexes `cellvars ++ freevars`
    LoadDeref,
    StoreDeref,
    DeleteDeref,
    LoadClassderef,
    LoadClosure,

    // constants
    LoadConst,
    LoadNone,
    LoadEllipsis,
    LoadTrue,
    LoadFalse,
    /// Signed 8-bit immediate.
    LoadByte,
    /// Index into the primitive pool.
    LoadLong,
    /// Index into the primitive pool, value stored as `f64` bits.
    LoadDouble,
    LoadBigint,
    LoadString,
    LoadBytes,
    LoadComplex,

    // functions and calls
    ClosureFromStack,
    /// Argument is the constant index of the code unit, the following byte holds
    /// `MakeFunctionFlags`.
    MakeFunction,
    /// Argument is the method name, pops an `Object[]` whose first element is the receiver.
    CallMethodVarargs,
    /// Argument is the method name, the following byte is the argument count.
    CallMethod,
    CallFunction,
    CallFunctionVarargs,
    CallFunctionKw,
    MakeKeyword,

    // imports
    ImportName,
    ImportFrom,
    ImportStar,

    RaiseVarargs,
    BuildSlice,

    // destructuring
    UnpackSequence,
    /// Argument is the count before the star, the following byte the count after it.
    UnpackEx,

    // collections, argument is `CollectionBits`
    CollectionFromStack,
    CollectionAddStack,
    CollectionAddCollection,
    CollectionFromCollection,
    AddToCollection,
    KwargsDictMerge,

    // exceptions
    PushExcInfo,
    PopExcept,
    EndExcHandler,
    UnwrapExc,

    // with statements
    SetupWith,
    ExitWith,

    // jumps: short form takes a one byte distance, far form a `u16`
    ForIter,
    ForIterFar,
    JumpForward,
    JumpForwardFar,
    JumpBackward,
    JumpBackwardFar,
    JumpIfFalseOrPop,
    JumpIfFalseOrPopFar,
    JumpIfTrueOrPop,
    JumpIfTrueOrPopFar,
    PopAndJumpIfFalse,
    PopAndJumpIfFalseFar,
    PopAndJumpIfTrue,
    PopAndJumpIfTrueFar,
    MatchExcOrJump,
    MatchExcOrJumpFar,

    ExtendedArg,
}

impl Opcode {
    /// Decodes an opcode byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// Disassembly name, e.g. `LOAD_FAST`.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Number of operand bytes following the opcode byte.
    #[must_use]
    pub fn arg_length(self) -> usize {
        if self.is_far_jump() {
            return 2;
        }
        match self {
            Self::Nop
            | Self::PopTop
            | Self::RotTwo
            | Self::RotThree
            | Self::DupTop
            | Self::BinarySubscr
            | Self::StoreSubscr
            | Self::DeleteSubscr
            | Self::GetIter
            | Self::LoadBuildClass
            | Self::LoadAssertionError
            | Self::ReturnValue
            | Self::LoadNone
            | Self::LoadEllipsis
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::CallFunctionVarargs
            | Self::CallFunctionKw
            | Self::KwargsDictMerge
            | Self::PushExcInfo
            | Self::PopExcept
            | Self::EndExcHandler
            | Self::UnwrapExc
            | Self::SetupWith
            | Self::ExitWith => 0,
            Self::CallMethod | Self::MakeFunction | Self::UnpackEx => 2,
            _ => 1,
        }
    }

    /// Number of operand bytes that are not part of the (extendable) immediate.
    #[must_use]
    pub fn following_arg_length(self) -> usize {
        match self {
            Self::CallMethod | Self::MakeFunction | Self::UnpackEx => 1,
            _ => 0,
        }
    }

    /// Total encoded size of the instruction, excluding any `ExtendedArg` prefixes.
    #[must_use]
    pub fn length(self) -> usize {
        1 + self.arg_length()
    }

    /// Net stack effect of the instruction.
    ///
    /// `jump` selects the taken edge for conditional jumps; it is ignored for
    /// other opcodes.
    #[must_use]
    pub fn stack_effect(self, arg: i32, following: &[u8], jump: bool) -> i32 {
        let first_following = || i32::from(following.first().copied().unwrap_or(0));
        match self.short_form() {
            Self::Nop
            | Self::RotTwo
            | Self::RotThree
            | Self::UnaryOp
            | Self::GetIter
            | Self::DeleteName
            | Self::DeleteGlobal
            | Self::DeleteFast
            | Self::DeleteDeref
            | Self::LoadAttr
            | Self::MakeKeyword
            | Self::CallMethodVarargs
            | Self::CollectionFromCollection
            | Self::UnwrapExc
            | Self::JumpForward
            | Self::JumpBackward
            | Self::ExtendedArg => 0,
            Self::PopTop
            | Self::BinaryOp
            | Self::BinarySubscr
            | Self::ReturnValue
            | Self::StoreName
            | Self::StoreGlobal
            | Self::StoreFast
            | Self::StoreDeref
            | Self::DeleteAttr
            | Self::CallFunctionVarargs
            | Self::ImportName
            | Self::ImportStar
            | Self::CollectionAddCollection
            | Self::KwargsDictMerge
            | Self::PopExcept
            | Self::PopAndJumpIfFalse
            | Self::PopAndJumpIfTrue
            | Self::MatchExcOrJump => -1,
            Self::DupTop
            | Self::LoadBuildClass
            | Self::LoadAssertionError
            | Self::LoadName
            | Self::LoadGlobal
            | Self::LoadFast
            | Self::LoadDeref
            | Self::LoadClassderef
            | Self::LoadClosure
            | Self::LoadConst
            | Self::LoadNone
            | Self::LoadEllipsis
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadByte
            | Self::LoadLong
            | Self::LoadDouble
            | Self::LoadBigint
            | Self::LoadString
            | Self::LoadBytes
            | Self::LoadComplex
            | Self::ImportFrom
            | Self::PushExcInfo => 1,
            Self::StoreAttr | Self::DeleteSubscr | Self::CallFunctionKw | Self::EndExcHandler => -2,
            Self::StoreSubscr | Self::ExitWith => -3,
            Self::SetupWith => 2,
            Self::ClosureFromStack | Self::BuildSlice => 1 - arg,
            Self::RaiseVarargs | Self::CallFunction => -arg,
            Self::CallMethod => -first_following(),
            Self::MakeFunction => 1 - first_following().count_ones().cast_signed(),
            Self::UnpackSequence => arg - 1,
            Self::UnpackEx => arg + first_following(),
            Self::CollectionFromStack => 1 - CollectionBits::count(arg),
            Self::CollectionAddStack => -CollectionBits::count(arg),
            Self::AddToCollection => {
                if CollectionBits::kind(arg) == CollectionBits::DICT {
                    -2
                } else {
                    -1
                }
            }
            Self::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            far => unreachable!("short_form returned far opcode {far:?}"),
        }
    }

    /// Whether the instruction can transfer control to its target block.
    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(
            self.short_form(),
            Self::ForIter
                | Self::JumpForward
                | Self::JumpBackward
                | Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
                | Self::PopAndJumpIfFalse
                | Self::PopAndJumpIfTrue
                | Self::MatchExcOrJump
        )
    }

    /// Whether the jump distance is subtracted from the instruction's bci.
    #[must_use]
    pub fn is_backward_jump(self) -> bool {
        matches!(self, Self::JumpBackward | Self::JumpBackwardFar)
    }

    /// Whether control never falls through to the next instruction.
    #[must_use]
    pub fn is_unconditional(self) -> bool {
        matches!(
            self.short_form(),
            Self::JumpForward | Self::JumpBackward | Self::ReturnValue | Self::RaiseVarargs | Self::EndExcHandler
        )
    }

    #[must_use]
    pub fn is_far_jump(self) -> bool {
        matches!(
            self,
            Self::ForIterFar
                | Self::JumpForwardFar
                | Self::JumpBackwardFar
                | Self::JumpIfFalseOrPopFar
                | Self::JumpIfTrueOrPopFar
                | Self::PopAndJumpIfFalseFar
                | Self::PopAndJumpIfTrueFar
                | Self::MatchExcOrJumpFar
        )
    }

    /// The two-byte variant of a short jump. Non-jumps and far jumps map to themselves.
    #[must_use]
    pub fn far_form(self) -> Self {
        match self {
            Self::ForIter => Self::ForIterFar,
            Self::JumpForward => Self::JumpForwardFar,
            Self::JumpBackward => Self::JumpBackwardFar,
            Self::JumpIfFalseOrPop => Self::JumpIfFalseOrPopFar,
            Self::JumpIfTrueOrPop => Self::JumpIfTrueOrPopFar,
            Self::PopAndJumpIfFalse => Self::PopAndJumpIfFalseFar,
            Self::PopAndJumpIfTrue => Self::PopAndJumpIfTrueFar,
            Self::MatchExcOrJump => Self::MatchExcOrJumpFar,
            other => other,
        }
    }

    /// Inverse of `far_form`.
    #[must_use]
    pub fn short_form(self) -> Self {
        match self {
            Self::ForIterFar => Self::ForIter,
            Self::JumpForwardFar => Self::JumpForward,
            Self::JumpBackwardFar => Self::JumpBackward,
            Self::JumpIfFalseOrPopFar => Self::JumpIfFalseOrPop,
            Self::JumpIfTrueOrPopFar => Self::JumpIfTrueOrPop,
            Self::PopAndJumpIfFalseFar => Self::PopAndJumpIfFalse,
            Self::PopAndJumpIfTrueFar => Self::PopAndJumpIfTrue,
            Self::MatchExcOrJumpFar => Self::MatchExcOrJump,
            other => other,
        }
    }

    /// Whether the runtime may replace this instruction with a type-specialized
    /// variant after observing its operands.
    #[must_use]
    pub fn can_quicken(self) -> bool {
        matches!(
            self,
            Self::LoadTrue
                | Self::LoadFalse
                | Self::LoadByte
                | Self::LoadLong
                | Self::LoadDouble
                | Self::LoadFast
                | Self::StoreFast
                | Self::UnaryOp
                | Self::BinaryOp
                | Self::BinarySubscr
                | Self::StoreSubscr
                | Self::ForIter
                | Self::PopAndJumpIfFalse
                | Self::PopAndJumpIfTrue
        )
    }
}

/// Encoding of the collection opcodes' argument: the upper three bits select
/// the collection kind, the lower five hold an element count.
pub struct CollectionBits;

impl CollectionBits {
    pub const COUNT_MASK: i32 = 0b0001_1111;
    /// Largest element count a single stack-building instruction can carry.
    pub const MAX_STACK_ELEMENT_COUNT: i32 = Self::COUNT_MASK;

    pub const LIST: i32 = 0b0010_0000;
    pub const TUPLE: i32 = 0b0100_0000;
    pub const SET: i32 = 0b0110_0000;
    pub const DICT: i32 = 0b1000_0000;
    pub const KWORDS: i32 = 0b1010_0000;
    pub const OBJECT: i32 = 0b1100_0000;

    #[must_use]
    pub fn count(arg: i32) -> i32 {
        arg & Self::COUNT_MASK
    }

    #[must_use]
    pub fn kind(arg: i32) -> i32 {
        arg & !Self::COUNT_MASK & 0xff
    }

    /// Human readable kind for disassembly.
    #[must_use]
    pub fn kind_name(arg: i32) -> &'static str {
        match Self::kind(arg) {
            Self::LIST => "list",
            Self::TUPLE => "tuple",
            Self::SET => "set",
            Self::DICT => "dict",
            Self::KWORDS => "PKeyword[]",
            Self::OBJECT => "Object[]",
            _ => "invalid",
        }
    }
}

/// Flags in the following byte of `MakeFunction`, one per value popped.
pub struct MakeFunctionFlags;

impl MakeFunctionFlags {
    pub const HAS_DEFAULTS: u8 = 0x1;
    pub const HAS_KWONLY_DEFAULTS: u8 = 0x2;
    pub const HAS_ANNOTATIONS: u8 = 0x4;
    pub const HAS_CLOSURE: u8 = 0x8;
}

/// Operand of `BinaryOp`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Matmul,
    Truediv,
    Floordiv,
    Mod,
    Pow,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
    InplaceAdd,
    InplaceSub,
    InplaceMul,
    InplaceMatmul,
    InplaceTruediv,
    InplaceFloordiv,
    InplaceMod,
    InplacePow,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceOr,
    InplaceXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    In,
}

impl BinaryOp {
    /// In-place counterpart used by augmented assignment.
    #[must_use]
    pub fn inplace(self) -> Self {
        match self {
            Self::Add => Self::InplaceAdd,
            Self::Sub => Self::InplaceSub,
            Self::Mul => Self::InplaceMul,
            Self::Matmul => Self::InplaceMatmul,
            Self::Truediv => Self::InplaceTruediv,
            Self::Floordiv => Self::InplaceFloordiv,
            Self::Mod => Self::InplaceMod,
            Self::Pow => Self::InplacePow,
            Self::Lshift => Self::InplaceLshift,
            Self::Rshift => Self::InplaceRshift,
            Self::And => Self::InplaceAnd,
            Self::Or => Self::InplaceOr,
            Self::Xor => Self::InplaceXor,
            other => other,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Operand of `UnaryOp`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UnaryOp {
    Positive,
    Negative,
    Invert,
    Not,
}

impl UnaryOp {
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn far_and_short_forms_are_inverse() {
        for byte in 0..u8::try_from(Opcode::COUNT).unwrap() {
            let op = Opcode::from_byte(byte).unwrap();
            if op.is_jump() {
                assert_eq!(op.far_form().short_form(), op.short_form());
                assert!(op.far_form().is_far_jump());
                assert_eq!(op.far_form().arg_length(), 2);
            } else {
                assert_eq!(op.far_form(), op);
            }
        }
    }

    #[test]
    fn names_are_screaming_snake_case() {
        assert_eq!(Opcode::LoadFast.name(), "LOAD_FAST");
        assert_eq!(Opcode::LoadClassderef.name(), "LOAD_CLASSDEREF");
        assert_eq!(Opcode::PopAndJumpIfFalseFar.name(), "POP_AND_JUMP_IF_FALSE_FAR");
        assert_eq!(BinaryOp::InplaceAdd.name(), "INPLACE_ADD");
    }

    #[test]
    fn conditional_effects_depend_on_edge() {
        assert_eq!(Opcode::ForIter.stack_effect(0, &[], true), -1);
        assert_eq!(Opcode::ForIter.stack_effect(0, &[], false), 1);
        assert_eq!(Opcode::JumpIfTrueOrPopFar.stack_effect(0, &[], true), 0);
        assert_eq!(Opcode::JumpIfTrueOrPopFar.stack_effect(0, &[], false), -1);
    }

    #[test]
    fn operand_dependent_effects() {
        assert_eq!(Opcode::CollectionFromStack.stack_effect(CollectionBits::LIST | 3, &[], false), -2);
        assert_eq!(Opcode::CollectionAddStack.stack_effect(CollectionBits::SET | 4, &[], false), -4);
        assert_eq!(Opcode::AddToCollection.stack_effect(CollectionBits::DICT | 2, &[], false), -2);
        assert_eq!(Opcode::UnpackEx.stack_effect(1, &[2], false), 3);
        assert_eq!(Opcode::CallMethod.stack_effect(0, &[3], false), -3);
        let flags = MakeFunctionFlags::HAS_DEFAULTS | MakeFunctionFlags::HAS_CLOSURE;
        assert_eq!(Opcode::MakeFunction.stack_effect(0, &[flags], false), -1);
    }

    #[test]
    fn collection_bits_split_kind_and_count() {
        let arg = CollectionBits::KWORDS | 7;
        assert_eq!(CollectionBits::kind(arg), CollectionBits::KWORDS);
        assert_eq!(CollectionBits::count(arg), 7);
        assert_eq!(CollectionBits::kind_name(arg), "PKeyword[]");
    }
}
