//! Lowering of the AST into blocks.
//!
//! The compiler keeps a stack of [`CompilationUnit`]s, one per scope being
//! compiled; the innermost is the one instructions go to. Each AST node kind has
//! a visit method. Control flow is expressed with blocks and jumps to blocks;
//! structured constructs push [`FrameBlock`]s so that exception regions can be
//! derived and `break`/`continue`/`return` can unwind through them.
//!
//! Name classification comes from [`ScopeAnalysis`] and is trusted without
//! checks.

use ahash::AHashSet;
use smallvec::{SmallVec, smallvec};

use super::{
    assemble::assemble,
    builder::BlockId,
    code::{CodeFlags, CodeUnit, Constant, UnitKind},
    collector::Collector,
    op::{BinaryOp, CollectionBits, MakeFunctionFlags, Opcode, UnaryOp},
    unit::{CompilationUnit, FrameBlock},
};
use crate::{
    ast::{
        BoolOperator, ClassDef, CmpOperator, Comp, CompKind, DictItem, ExceptHandler, Expr, ExprLoc, FunctionDef,
        Keyword, Lambda, Literal, Module, Operator, Parameters, ScopeId, Stmt, StmtLoc, Try, UnaryOperator, WithItem,
    },
    diagnostics::Diagnostics,
    error::{CompileError, WarningKind},
    location::CodeRange,
    options::CompileOptions,
    scope::{CLASS_CELL, COMPREHENSION_ITER, ScopeAnalysis, ScopeKind, SymbolKind},
};

/// Calls with at most this many plain positional arguments push them directly.
const MAX_SHORT_CALL_ARGS: usize = 4;
/// Same for method calls, where the receiver takes one more slot.
const MAX_SHORT_METHOD_ARGS: usize = 3;

/// Compiles an analyzed module into its code unit.
pub(crate) fn compile_module<'a>(
    module: &'a Module,
    scopes: &'a ScopeAnalysis,
    options: &'a CompileOptions,
    diagnostics: &mut dyn Diagnostics,
) -> Result<CodeUnit, CompileError> {
    let mut compiler = Compiler {
        scopes,
        options,
        diagnostics,
        units: Vec::new(),
        depth: 0,
    };
    compiler.compile_module(module)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameCtx {
    Load,
    Store,
    Delete,
}

/// The reason the frame stack is being unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unwind {
    Break,
    Continue,
    /// Returning a value already on the stack, which must be preserved.
    ReturnValue,
    /// Returning a value that is loaded after the unwind.
    ReturnConst,
}

/// The three blocks of a `finally` clause.
#[derive(Debug, Clone, Copy)]
struct FinallyBlocks {
    /// The copy run when the protected code completes normally.
    normal: BlockId,
    /// Handler entry: the exception is on the stack.
    except: BlockId,
    /// The exception-path copy, entered with the saved exception state below the exception.
    except_with_saved: BlockId,
}

struct Compiler<'a, 'd> {
    scopes: &'a ScopeAnalysis,
    options: &'a CompileOptions,
    diagnostics: &'d mut dyn Diagnostics,
    units: Vec<CompilationUnit<'a>>,
    depth: u16,
}

impl<'a> Compiler<'a, '_> {
    fn compile_module(&mut self, module: &'a Module) -> Result<CodeUnit, CompileError> {
        self.enter_scope(ScopeId::MODULE, UnitKind::Module, "<module>", module.position);
        let body = self.store_docstring(&module.body)?;
        match body.split_last() {
            // the value of a trailing expression statement is the module's result
            Some((last, rest)) if matches!(&last.stmt, Stmt::Expr(value) if !matches!(value.expr, Expr::Literal(_))) => {
                self.visit_body(rest)?;
                let Stmt::Expr(value) = &last.stmt else {
                    unreachable!("matched above");
                };
                self.with_location(last.position, |this| {
                    this.visit_expr(value)?;
                    this.add_op(Opcode::ReturnValue);
                    Ok(())
                })?;
            }
            _ => self.visit_body(body)?,
        }
        self.exit_scope()
    }

    // === Units ===

    fn unit(&mut self) -> &mut CompilationUnit<'a> {
        self.units.last_mut().expect("a compilation unit is always active")
    }

    fn unit_ref(&self) -> &CompilationUnit<'a> {
        self.units.last().expect("a compilation unit is always active")
    }

    fn enter_scope(&mut self, id: ScopeId, kind: UnitKind, name: &str, range: CodeRange) {
        let scope = self.scopes.scope(id);
        let qualname = match self.units.last() {
            Some(parent) if parent.kind != UnitKind::Module && !scope.is_declared_global() => {
                if parent.scope.is_function_like() {
                    format!("{}.<locals>.{name}", parent.qualname)
                } else {
                    format!("{}.{name}", parent.qualname)
                }
            }
            _ => name.to_owned(),
        };
        let nested = self
            .units
            .last()
            .is_some_and(|parent| parent.scope.is_function_like() || parent.flags & CodeFlags::NESTED != 0);
        let mut unit = CompilationUnit::new(kind, scope, name.to_owned(), qualname, range);
        if nested {
            unit.flags |= CodeFlags::NESTED;
        }
        self.units.push(unit);
    }

    fn exit_scope(&mut self) -> Result<CodeUnit, CompileError> {
        let unit = self.units.pop().expect("exit_scope without a matching enter_scope");
        assemble(unit, self.options.get_filename())
    }

    fn set_arg_counts(&mut self, params: &Parameters) {
        let unit = self.unit();
        unit.posonlyargcount = to_u32(params.posonly.len());
        unit.argcount = to_u32(params.posonly.len() + params.args.len());
        unit.kwonlyargcount = to_u32(params.kwonly.len());
        if params.vararg.is_some() {
            unit.flags |= CodeFlags::VARARGS;
        }
        if params.kwarg.is_some() {
            unit.flags |= CodeFlags::VARKEYWORDS;
        }
    }

    // === Emission helpers ===

    fn location(&self) -> CodeRange {
        self.unit_ref().location
    }

    fn with_location<T>(&mut self, range: CodeRange, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = std::mem::replace(&mut self.unit().location, range);
        let result = f(self);
        self.unit().location = saved;
        result
    }

    fn add_op(&mut self, opcode: Opcode) {
        self.unit().emit(opcode, 0, SmallVec::new(), None);
    }

    fn add_op_arg(&mut self, opcode: Opcode, arg: i32) {
        self.unit().emit(opcode, arg, SmallVec::new(), None);
    }

    fn add_op_following(&mut self, opcode: Opcode, arg: i32, following: u8) {
        self.unit().emit(opcode, arg, smallvec![following], None);
    }

    fn add_jump(&mut self, opcode: Opcode, target: BlockId) {
        self.unit().emit(opcode, 0, SmallVec::new(), Some(target));
    }

    fn add_constant_op(&mut self, opcode: Opcode, constant: Constant) {
        let index = self.unit().add_constant(constant);
        self.add_op_arg(opcode, index);
    }

    fn add_load_long(&mut self, value: i64) {
        if let Ok(byte) = i8::try_from(value) {
            self.add_op_arg(Opcode::LoadByte, i32::from(byte));
        } else {
            let index = self.unit().add_primitive(value.cast_unsigned());
            self.add_op_arg(Opcode::LoadLong, index);
        }
    }

    fn new_block(&mut self) -> BlockId {
        self.unit().new_block()
    }

    /// Continues in a fresh block after an unconditional exit. Code following
    /// the exit lands there and is dropped by the assembler unless jumped to.
    fn start_dead_block(&mut self) {
        let next = self.new_block();
        self.use_next_block(next);
    }

    fn use_next_block(&mut self, block: BlockId) {
        self.unit().use_next_block(block);
    }

    fn batch_size(&self) -> u8 {
        self.options.get_collection_batch_size()
    }

    fn enter_nesting(&mut self, range: CodeRange) -> Result<(), CompileError> {
        if self.depth >= self.options.get_max_nesting_depth() {
            return Err(CompileError::resource_limit(
                "maximum recursion depth exceeded during compilation",
                range,
            ));
        }
        self.depth += 1;
        Ok(())
    }

    // === Names ===

    fn name_op(&mut self, name: &str, ctx: NameCtx) -> Result<(), CompileError> {
        if name == "__debug__" {
            match ctx {
                NameCtx::Store => return Err(CompileError::syntax("cannot assign to __debug__", self.location())),
                NameCtx::Delete => return Err(CompileError::syntax("cannot delete __debug__", self.location())),
                NameCtx::Load => {}
            }
        }
        let pick = |load, store, delete| match ctx {
            NameCtx::Load => load,
            NameCtx::Store => store,
            NameCtx::Delete => delete,
        };
        let unit = self.unit();
        let kind = unit.scope.lookup(name);
        let function_like = unit.scope.is_function_like();
        let (opcode, arg) = match kind {
            SymbolKind::Free | SymbolKind::Cell => {
                let arg = if kind == SymbolKind::Free {
                    unit.free_index(name)
                } else {
                    unit.cell_index(name)
                };
                let load = if unit.kind == UnitKind::Class {
                    Opcode::LoadClassderef
                } else {
                    Opcode::LoadDeref
                };
                (pick(load, Opcode::StoreDeref, Opcode::DeleteDeref), arg)
            }
            SymbolKind::Local if function_like => (
                pick(Opcode::LoadFast, Opcode::StoreFast, Opcode::DeleteFast),
                unit.varname_index(name),
            ),
            SymbolKind::GlobalExplicit | SymbolKind::GlobalImplicit
                if function_like || kind == SymbolKind::GlobalExplicit =>
            {
                (
                    pick(Opcode::LoadGlobal, Opcode::StoreGlobal, Opcode::DeleteGlobal),
                    unit.name_index(name),
                )
            }
            SymbolKind::Local | SymbolKind::GlobalImplicit | SymbolKind::GlobalExplicit | SymbolKind::DefFreeClass => (
                pick(Opcode::LoadName, Opcode::StoreName, Opcode::DeleteName),
                unit.name_index(name),
            ),
        };
        self.add_op_arg(opcode, arg);
        Ok(())
    }

    // === Statements ===

    fn visit_body(&mut self, body: &'a [StmtLoc]) -> Result<(), CompileError> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    /// Stores a leading docstring in `__doc__` and returns the remaining statements.
    fn store_docstring(&mut self, body: &'a [StmtLoc]) -> Result<&'a [StmtLoc], CompileError> {
        if let Some((first, rest)) = body.split_first()
            && let Stmt::Expr(ExprLoc {
                expr: Expr::Literal(Literal::Str(doc)),
                ..
            }) = &first.stmt
        {
            self.with_location(first.position, |this| {
                this.add_constant_op(Opcode::LoadString, Constant::Str(doc.clone()));
                this.name_op("__doc__", NameCtx::Store)
            })?;
            return Ok(rest);
        }
        Ok(body)
    }

    fn visit_stmt(&mut self, stmt: &'a StmtLoc) -> Result<(), CompileError> {
        self.enter_nesting(stmt.position)?;
        let result = self.with_location(stmt.position, |this| this.visit_stmt_impl(stmt));
        self.depth -= 1;
        result
    }

    fn visit_stmt_impl(&mut self, stmt: &'a StmtLoc) -> Result<(), CompileError> {
        let range = stmt.position;
        match &stmt.stmt {
            Stmt::Pass | Stmt::Global(_) | Stmt::Nonlocal(_) => Ok(()),
            Stmt::Expr(value) => {
                if matches!(value.expr, Expr::Literal(_)) {
                    return Ok(());
                }
                self.visit_expr(value)?;
                self.add_op(Opcode::PopTop);
                Ok(())
            }
            Stmt::Assign { targets, value } => {
                self.visit_expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.add_op(Opcode::DupTop);
                    }
                    self.visit_store(target)?;
                }
                Ok(())
            }
            Stmt::AugAssign { target, op, value } => self.visit_aug_assign(target, *op, value),
            Stmt::Delete(targets) => {
                for target in targets {
                    self.visit_delete(target)?;
                }
                Ok(())
            }
            Stmt::Return(value) => self.visit_return(value.as_ref()),
            Stmt::Break => {
                if self.unit_ref().innermost_loop().is_none() {
                    return Err(CompileError::syntax("'break' outside loop", range));
                }
                match self.unwind_frames(Unwind::Break)? {
                    Some(FrameBlock::For { end, .. } | FrameBlock::While { end, .. }) => {
                        self.add_jump(Opcode::JumpForward, end);
                    }
                    other => unreachable!("unwinding for break stopped at {other:?}"),
                }
                self.start_dead_block();
                Ok(())
            }
            Stmt::Continue => {
                if self.unit_ref().innermost_loop().is_none() {
                    return Err(CompileError::syntax("'continue' not properly in loop", range));
                }
                match self.unwind_frames(Unwind::Continue)? {
                    Some(FrameBlock::For { start, .. } | FrameBlock::While { start, .. }) => {
                        self.add_jump(Opcode::JumpBackward, start);
                    }
                    other => unreachable!("unwinding for continue stopped at {other:?}"),
                }
                self.start_dead_block();
                Ok(())
            }
            Stmt::Raise { exc, cause } => {
                let mut argc = 0;
                if let Some(exc) = exc {
                    self.visit_expr(exc)?;
                    argc += 1;
                    if let Some(cause) = cause {
                        self.visit_expr(cause)?;
                        argc += 1;
                    }
                }
                self.add_op_arg(Opcode::RaiseVarargs, argc);
                self.start_dead_block();
                Ok(())
            }
            Stmt::Assert { test, msg } => self.visit_assert(test, msg.as_ref()),
            Stmt::If { test, body, orelse } => self.visit_if(test, body, orelse),
            Stmt::While { test, body, orelse } => self.visit_while(test, body, orelse),
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => self.visit_for(target, iter, body, orelse),
            Stmt::With { items, body } => {
                self.visit_with(items, 0, body)?;
                let next = self.new_block();
                self.use_next_block(next);
                Ok(())
            }
            Stmt::Try(try_stmt) => self.visit_try(try_stmt),
            Stmt::FunctionDef(def) => self.visit_function_def(def, range),
            Stmt::ClassDef(class) => self.visit_class_def(class, range),
            Stmt::Import(aliases) => {
                for alias in aliases {
                    self.with_location(alias.position, |this| this.visit_import_alias(&alias.name, alias.asname.as_deref()))?;
                }
                Ok(())
            }
            Stmt::ImportFrom { module, names, level } => {
                self.add_load_long(i64::from(*level));
                let module = module.as_deref().unwrap_or("");
                let module_index = self.unit().name_index(module);
                if names.first().is_some_and(|alias| alias.name == "*") {
                    self.add_op_arg(Opcode::ImportStar, module_index);
                    return Ok(());
                }
                let fromlist = names.iter().map(|alias| alias.name.clone()).collect();
                self.add_constant_op(Opcode::LoadConst, Constant::StrArray(fromlist));
                self.add_op_arg(Opcode::ImportName, module_index);
                for alias in names {
                    let name_index = self.unit().name_index(&alias.name);
                    self.add_op_arg(Opcode::ImportFrom, name_index);
                    self.name_op(alias.asname.as_deref().unwrap_or(&alias.name), NameCtx::Store)?;
                }
                self.add_op(Opcode::PopTop);
                Ok(())
            }
        }
    }

    fn visit_import_alias(&mut self, name: &str, asname: Option<&str>) -> Result<(), CompileError> {
        self.add_op_arg(Opcode::LoadByte, 0);
        self.add_constant_op(Opcode::LoadConst, Constant::StrArray(Vec::new()));
        let index = self.unit().name_index(name);
        self.add_op_arg(Opcode::ImportName, index);
        let mut components = name.split('.');
        let first = components.next().unwrap_or(name);
        match asname {
            Some(asname) if name.contains('.') => {
                // IMPORT_NAME returned the top-level package; walk down to the leaf
                let rest: Vec<&str> = components.collect();
                for (i, component) in rest.iter().enumerate() {
                    let index = self.unit().name_index(component);
                    self.add_op_arg(Opcode::ImportFrom, index);
                    if i + 1 < rest.len() {
                        self.add_op(Opcode::RotTwo);
                        self.add_op(Opcode::PopTop);
                    }
                }
                self.name_op(asname, NameCtx::Store)?;
                self.add_op(Opcode::PopTop);
                Ok(())
            }
            Some(asname) => self.name_op(asname, NameCtx::Store),
            None => self.name_op(first, NameCtx::Store),
        }
    }

    fn visit_aug_assign(&mut self, target: &'a ExprLoc, op: Operator, value: &'a ExprLoc) -> Result<(), CompileError> {
        let op = binary_op(op).inplace() as i32;
        match &target.expr {
            Expr::Name(name) => {
                self.with_location(target.position, |this| this.name_op(name, NameCtx::Load))?;
                self.visit_expr(value)?;
                self.add_op_arg(Opcode::BinaryOp, op);
                self.with_location(target.position, |this| this.name_op(name, NameCtx::Store))
            }
            Expr::Attribute { value: object, attr } => {
                self.visit_expr(object)?;
                let index = self.unit().name_index(attr);
                self.add_op(Opcode::DupTop);
                self.add_op_arg(Opcode::LoadAttr, index);
                self.visit_expr(value)?;
                self.add_op_arg(Opcode::BinaryOp, op);
                self.add_op(Opcode::RotTwo);
                self.add_op_arg(Opcode::StoreAttr, index);
                Ok(())
            }
            Expr::Subscript { value: object, slice } => {
                self.visit_expr(object)?;
                self.visit_expr(slice)?;
                // [o, i] -> [i, o, o, i]
                self.add_op(Opcode::DupTop);
                self.add_op(Opcode::RotThree);
                self.add_op(Opcode::RotThree);
                self.add_op(Opcode::DupTop);
                self.add_op(Opcode::RotThree);
                self.add_op(Opcode::RotTwo);
                self.add_op(Opcode::BinarySubscr);
                self.visit_expr(value)?;
                self.add_op_arg(Opcode::BinaryOp, op);
                // [i, o, r] -> [r, o, i]
                self.add_op(Opcode::RotThree);
                self.add_op(Opcode::RotTwo);
                self.add_op(Opcode::StoreSubscr);
                Ok(())
            }
            _ => Err(CompileError::syntax(
                "illegal expression for augmented assignment",
                target.position,
            )),
        }
    }

    fn visit_store(&mut self, target: &'a ExprLoc) -> Result<(), CompileError> {
        self.with_location(target.position, |this| match &target.expr {
            Expr::Name(name) => this.name_op(name, NameCtx::Store),
            Expr::Attribute { value, attr } => {
                this.visit_expr(value)?;
                let index = this.unit().name_index(attr);
                this.add_op_arg(Opcode::StoreAttr, index);
                Ok(())
            }
            Expr::Subscript { value, slice } => {
                this.visit_expr(value)?;
                this.visit_expr(slice)?;
                this.add_op(Opcode::StoreSubscr);
                Ok(())
            }
            Expr::Tuple(elements) | Expr::List(elements) => this.unpack_into(elements),
            Expr::Starred(_) => Err(CompileError::syntax(
                "starred assignment target must be in a list or tuple",
                target.position,
            )),
            _ => Err(CompileError::syntax("cannot assign to expression", target.position)),
        })
    }

    fn unpack_into(&mut self, elements: &'a [ExprLoc]) -> Result<(), CompileError> {
        let mut star = None;
        for (i, element) in elements.iter().enumerate() {
            if matches!(element.expr, Expr::Starred(_)) {
                if star.is_some() {
                    return Err(CompileError::syntax(
                        "multiple starred expressions in assignment",
                        element.position,
                    ));
                }
                star = Some(i);
            }
        }
        if let Some(before) = star {
            let after = elements.len() - before - 1;
            let after = i8::try_from(after)
                .map_err(|_| CompileError::syntax("too many expressions in star-unpacking assignment", self.location()))?;
            self.add_op_following(Opcode::UnpackEx, to_i32(before), after.to_le_bytes()[0]);
        } else {
            self.add_op_arg(Opcode::UnpackSequence, to_i32(elements.len()));
        }
        for element in elements {
            match &element.expr {
                Expr::Starred(inner) => self.visit_store(inner)?,
                _ => self.visit_store(element)?,
            }
        }
        Ok(())
    }

    fn visit_delete(&mut self, target: &'a ExprLoc) -> Result<(), CompileError> {
        self.with_location(target.position, |this| match &target.expr {
            Expr::Name(name) => this.name_op(name, NameCtx::Delete),
            Expr::Attribute { value, attr } => {
                this.visit_expr(value)?;
                let index = this.unit().name_index(attr);
                this.add_op_arg(Opcode::DeleteAttr, index);
                Ok(())
            }
            Expr::Subscript { value, slice } => {
                this.visit_expr(value)?;
                this.visit_expr(slice)?;
                this.add_op(Opcode::DeleteSubscr);
                Ok(())
            }
            Expr::Tuple(elements) | Expr::List(elements) => {
                for element in elements {
                    this.visit_delete(element)?;
                }
                Ok(())
            }
            _ => Err(CompileError::syntax("cannot delete expression", target.position)),
        })
    }

    fn visit_return(&mut self, value: Option<&'a ExprLoc>) -> Result<(), CompileError> {
        if !self.unit_ref().scope.is_function_like() {
            return Err(CompileError::syntax("'return' outside function", self.location()));
        }
        match value {
            None => {
                self.unwind_frames(Unwind::ReturnConst)?;
                self.add_op(Opcode::LoadNone);
            }
            Some(value) if matches!(value.expr, Expr::Literal(_)) => {
                self.unwind_frames(Unwind::ReturnConst)?;
                self.visit_expr(value)?;
            }
            Some(value) => {
                self.visit_expr(value)?;
                self.unwind_frames(Unwind::ReturnValue)?;
            }
        }
        self.add_op(Opcode::ReturnValue);
        self.start_dead_block();
        Ok(())
    }

    /// Emits the inline cleanup of every frame crossed by a non-local exit.
    ///
    /// Frames are processed innermost first with the frame stack cut down to
    /// the frames outside the one being cleaned up, so code emitted for a frame
    /// (a `finally` body in particular) is protected only by the enclosing
    /// handlers. For `break` and `continue` the walk stops at the innermost loop,
    /// which is returned. The frame stack is restored afterwards.
    fn unwind_frames(&mut self, reason: Unwind) -> Result<Option<FrameBlock<'a>>, CompileError> {
        let saved = self.unit().take_frames();
        let mut reached = None;
        let with_value = reason == Unwind::ReturnValue;
        for (i, frame) in saved.iter().enumerate().rev() {
            self.unit().set_frames(saved[..i].to_vec());
            match *frame {
                FrameBlock::For { .. } => {
                    if reason == Unwind::Continue {
                        reached = Some(*frame);
                        break;
                    }
                    if with_value {
                        self.add_op(Opcode::RotTwo);
                    }
                    self.add_op(Opcode::PopTop);
                    if reason == Unwind::Break {
                        reached = Some(*frame);
                        break;
                    }
                }
                FrameBlock::While { .. } => {
                    if matches!(reason, Unwind::Break | Unwind::Continue) {
                        reached = Some(*frame);
                        break;
                    }
                }
                FrameBlock::With { .. } => {
                    let next = self.new_block();
                    self.use_next_block(next);
                    if with_value {
                        self.add_op(Opcode::RotThree);
                    }
                    self.add_op(Opcode::LoadNone);
                    self.add_op(Opcode::ExitWith);
                }
                FrameBlock::TryExcept { .. } => {}
                FrameBlock::TryFinally { finalbody, .. } => {
                    let next = self.new_block();
                    self.use_next_block(next);
                    if with_value {
                        self.unit().push_frame(FrameBlock::PopValue);
                    }
                    self.visit_body(finalbody)?;
                    if with_value {
                        self.unit().pop_frame();
                    }
                }
                FrameBlock::ExceptHandler { .. } => {
                    if with_value {
                        self.add_op(Opcode::RotTwo);
                    }
                    self.add_op(Opcode::PopExcept);
                }
                FrameBlock::HandlerBindingCleanup { name, .. } => {
                    self.name_op(name, NameCtx::Delete)?;
                }
                FrameBlock::FinallyHandler { .. } => {
                    // [saved, exc] below the value
                    if with_value {
                        self.add_op(Opcode::RotThree);
                    }
                    self.add_op(Opcode::PopTop);
                    self.add_op(Opcode::PopExcept);
                }
                FrameBlock::PopValue => {
                    if with_value {
                        self.add_op(Opcode::RotTwo);
                    }
                    self.add_op(Opcode::PopTop);
                }
            }
        }
        self.unit().set_frames(saved);
        Ok(reached)
    }

    fn visit_assert(&mut self, test: &'a ExprLoc, msg: Option<&'a ExprLoc>) -> Result<(), CompileError> {
        if matches!(&test.expr, Expr::Tuple(elements) if !elements.is_empty()) {
            self.diagnostics.on_warning(
                WarningKind::Syntax,
                test.position,
                "assertion is always true, perhaps remove parentheses?",
            );
        }
        if self.options.is_optimized() {
            return Ok(());
        }
        let end = self.new_block();
        self.jump_if(test, end, true)?;
        self.add_op(Opcode::LoadAssertionError);
        if let Some(msg) = msg {
            self.visit_expr(msg)?;
            self.add_op_arg(Opcode::CallFunction, 1);
        }
        self.add_op_arg(Opcode::RaiseVarargs, 1);
        self.use_next_block(end);
        Ok(())
    }

    fn visit_if(&mut self, test: &'a ExprLoc, body: &'a [StmtLoc], orelse: &'a [StmtLoc]) -> Result<(), CompileError> {
        let end = self.new_block();
        let alternative = if orelse.is_empty() { end } else { self.new_block() };
        self.jump_if(test, alternative, false)?;
        let then = self.new_block();
        self.use_next_block(then);
        self.visit_body(body)?;
        if !orelse.is_empty() {
            self.add_jump(Opcode::JumpForward, end);
            self.use_next_block(alternative);
            self.visit_body(orelse)?;
        }
        self.use_next_block(end);
        Ok(())
    }

    fn visit_while(&mut self, test: &'a ExprLoc, body: &'a [StmtLoc], orelse: &'a [StmtLoc]) -> Result<(), CompileError> {
        let start = self.new_block();
        let body_block = self.new_block();
        let end = self.new_block();
        let orelse_block = (!orelse.is_empty()).then(|| self.new_block());
        self.use_next_block(start);
        self.jump_if(test, orelse_block.unwrap_or(end), false)?;
        self.use_next_block(body_block);
        self.unit().push_frame(FrameBlock::While { start, end });
        self.visit_body(body)?;
        self.add_jump(Opcode::JumpBackward, start);
        self.unit().pop_frame();
        if let Some(orelse_block) = orelse_block {
            self.use_next_block(orelse_block);
            self.visit_body(orelse)?;
        }
        self.use_next_block(end);
        Ok(())
    }

    fn visit_for(
        &mut self,
        target: &'a ExprLoc,
        iter: &'a ExprLoc,
        body: &'a [StmtLoc],
        orelse: &'a [StmtLoc],
    ) -> Result<(), CompileError> {
        self.visit_expr(iter)?;
        self.add_op(Opcode::GetIter);
        let head = self.new_block();
        let body_block = self.new_block();
        let end = self.new_block();
        let orelse_block = (!orelse.is_empty()).then(|| self.new_block());
        self.use_next_block(head);
        self.add_jump(Opcode::ForIter, orelse_block.unwrap_or(end));
        self.use_next_block(body_block);
        self.unit().push_frame(FrameBlock::For { start: head, end });
        self.visit_store(target)?;
        self.visit_body(body)?;
        self.add_jump(Opcode::JumpBackward, head);
        self.unit().pop_frame();
        if let Some(orelse_block) = orelse_block {
            self.use_next_block(orelse_block);
            self.visit_body(orelse)?;
        }
        self.use_next_block(end);
        Ok(())
    }

    /// Lowers item `index` of a `with` statement; the remaining items nest inside it.
    fn visit_with(&mut self, items: &'a [WithItem], index: usize, body: &'a [StmtLoc]) -> Result<(), CompileError> {
        let item = &items[index];
        let statement = self.location();
        self.visit_expr(&item.context)?;
        self.add_op(Opcode::SetupWith);
        let handler = self.new_block();
        let body_block = self.new_block();
        self.unit().push_frame(FrameBlock::With { handler });
        self.use_next_block(body_block);
        // the unwinder also drops the value left by SETUP_WITH
        self.unit().set_unwind_offset(handler, -1);
        match &item.target {
            Some(target) => self.visit_store(target)?,
            None => self.add_op(Opcode::PopTop),
        }
        if index + 1 < items.len() {
            self.visit_with(items, index + 1, body)?;
        } else {
            self.visit_body(body)?;
        }
        self.with_location(statement, |this| {
            this.add_op(Opcode::LoadNone);
            this.unit().pop_frame();
            this.use_next_block(handler);
            this.add_op(Opcode::ExitWith);
        });
        Ok(())
    }

    fn visit_try(&mut self, node: &'a Try) -> Result<(), CompileError> {
        let end = self.new_block();
        let finally = if node.finalbody.is_empty() {
            None
        } else {
            Some(FinallyBlocks {
                normal: self.new_block(),
                except: self.new_block(),
                except_with_saved: self.new_block(),
            })
        };
        if let Some(finally) = finally {
            self.unit().push_frame(FrameBlock::TryFinally {
                handler: finally.except,
                finalbody: &node.finalbody,
            });
        }
        let except_block = self.new_block();
        let has_handlers = !node.handlers.is_empty();
        if has_handlers {
            self.unit().push_frame(FrameBlock::TryExcept { handler: except_block });
        }
        let body_block = self.new_block();
        self.use_next_block(body_block);
        self.visit_body(&node.body)?;
        if has_handlers {
            self.unit().pop_frame();
        }
        let after_normal = finally.map_or(end, |f| f.normal);
        let orelse_block = (!node.orelse.is_empty()).then(|| self.new_block());
        self.add_jump(Opcode::JumpForward, orelse_block.unwrap_or(after_normal));

        if has_handlers {
            self.visit_except_handlers(&node.handlers, except_block, finally, after_normal)?;
        }
        if let Some(orelse_block) = orelse_block {
            self.use_next_block(orelse_block);
            self.visit_body(&node.orelse)?;
            if finally.is_some() {
                self.add_jump(Opcode::JumpForward, after_normal);
            }
        }
        if let Some(finally) = finally {
            self.unit().pop_frame();
            // exception path: runs the body with the exception state saved
            self.use_next_block(finally.except);
            self.add_op(Opcode::PushExcInfo);
            let cleanup = self.new_block();
            self.unit().set_unwind_offset(cleanup, -1);
            self.unit().push_frame(FrameBlock::FinallyHandler { cleanup });
            self.use_next_block(finally.except_with_saved);
            self.visit_body(&node.finalbody)?;
            self.unit().pop_frame();
            self.use_next_block(cleanup);
            self.add_op(Opcode::EndExcHandler);
            // normal path
            self.use_next_block(finally.normal);
            self.visit_body(&node.finalbody)?;
        }
        self.use_next_block(end);
        Ok(())
    }

    fn visit_except_handlers(
        &mut self,
        handlers: &'a [ExceptHandler],
        except_block: BlockId,
        finally: Option<FinallyBlocks>,
        after_normal: BlockId,
    ) -> Result<(), CompileError> {
        self.use_next_block(except_block);
        self.add_op(Opcode::PushExcInfo);
        let common_cleanup = self.new_block();
        self.unit().set_unwind_offset(common_cleanup, -1);
        self.unit().push_frame(FrameBlock::ExceptHandler { cleanup: common_cleanup });

        let mut next_handler = self.new_block();
        for (i, handler) in handlers.iter().enumerate() {
            if i > 0 && handlers[i - 1].exc_type.is_none() {
                return Err(CompileError::syntax(
                    "default 'except:' must be last",
                    handlers[i - 1].position,
                ));
            }
            self.use_next_block(next_handler);
            next_handler = if i + 1 < handlers.len() {
                self.new_block()
            } else {
                finally.map_or(common_cleanup, |f| f.except_with_saved)
            };
            self.with_location(handler.position, |this| {
                this.visit_except_handler(handler, next_handler, finally, after_normal)
            })?;
        }

        self.unit().pop_frame();
        self.use_next_block(common_cleanup);
        self.cleanup_on_exception_in_handler(finally);
        Ok(())
    }

    /// One `except` clause. Entered with `[saved, exc]` on the stack.
    fn visit_except_handler(
        &mut self,
        handler: &'a ExceptHandler,
        next_handler: BlockId,
        finally: Option<FinallyBlocks>,
        after_normal: BlockId,
    ) -> Result<(), CompileError> {
        if let Some(exc_type) = &handler.exc_type {
            self.visit_expr(exc_type)?;
            self.add_jump(Opcode::MatchExcOrJump, next_handler);
        }
        let Some(name) = &handler.name else {
            self.add_op(Opcode::PopTop);
            self.visit_body(&handler.body)?;
            self.add_op(Opcode::PopExcept);
            self.add_jump(Opcode::JumpForward, after_normal);
            return Ok(());
        };

        self.add_op(Opcode::UnwrapExc);
        self.name_op(&name.name, NameCtx::Store)?;
        let binding_cleaner = self.new_block();
        self.unit().push_frame(FrameBlock::HandlerBindingCleanup {
            cleanup: binding_cleaner,
            name: &name.name,
        });
        let body = self.new_block();
        self.use_next_block(body);
        self.visit_body(&handler.body)?;
        self.unit().pop_frame();
        let exit = self.new_block();
        self.use_next_block(exit);
        self.name_op(&name.name, NameCtx::Delete)?;
        self.add_op(Opcode::PopExcept);
        self.add_jump(Opcode::JumpForward, after_normal);

        self.use_next_block(binding_cleaner);
        self.name_op(&name.name, NameCtx::Delete)?;
        self.cleanup_on_exception_in_handler(finally);
        Ok(())
    }

    /// Re-raises from a handler cleanup block entered with `[saved, exc]`.
    fn cleanup_on_exception_in_handler(&mut self, finally: Option<FinallyBlocks>) {
        if let Some(finally) = finally {
            self.add_op(Opcode::RotTwo);
            self.add_op(Opcode::PopExcept);
            self.add_jump(Opcode::JumpForward, finally.except);
        } else {
            self.add_op(Opcode::EndExcHandler);
        }
    }

    fn visit_function_def(&mut self, def: &'a FunctionDef, range: CodeRange) -> Result<(), CompileError> {
        for decorator in &def.decorators {
            self.visit_expr(decorator)?;
        }
        let flags = self.collect_defaults(&def.params)?;
        self.enter_scope(def.scope, UnitKind::Function, &def.name, range);
        self.set_arg_counts(&def.params);
        let docstring = match def.body.first().map(|stmt| &stmt.stmt) {
            Some(Stmt::Expr(ExprLoc {
                expr: Expr::Literal(Literal::Str(doc)),
                ..
            })) => Constant::Str(doc.clone()),
            _ => Constant::None,
        };
        self.unit().add_constant(docstring);
        self.visit_body(&def.body)?;
        let code = self.exit_scope()?;
        self.make_closure(code, flags);
        for _ in &def.decorators {
            self.add_op_arg(Opcode::CallFunction, 1);
        }
        self.with_location(def.binding.position, |this| this.name_op(&def.binding.name, NameCtx::Store))
    }

    fn visit_class_def(&mut self, class: &'a ClassDef, range: CodeRange) -> Result<(), CompileError> {
        for decorator in &class.decorators {
            self.visit_expr(decorator)?;
        }
        self.add_op(Opcode::LoadBuildClass);

        self.enter_scope(class.scope, UnitKind::Class, &class.name, range);
        self.name_op("__name__", NameCtx::Load)?;
        self.name_op("__module__", NameCtx::Store)?;
        let qualname = self.unit_ref().qualname.clone();
        self.add_constant_op(Opcode::LoadString, Constant::Str(qualname));
        self.name_op("__qualname__", NameCtx::Store)?;
        let body = self.store_docstring(&class.body)?;
        self.visit_body(body)?;
        if self.unit_ref().scope.needs_class_closure() {
            let index = self.unit().cell_index(CLASS_CELL);
            self.add_op_arg(Opcode::LoadClosure, index);
            self.add_op(Opcode::DupTop);
            self.name_op("__classcell__", NameCtx::Store)?;
        } else {
            self.add_op(Opcode::LoadNone);
        }
        self.add_op(Opcode::ReturnValue);
        let code = self.exit_scope()?;

        self.make_closure(code, 0);
        self.add_constant_op(Opcode::LoadString, Constant::Str(class.name.clone()));
        let plain_bases = !class.bases.iter().any(is_starred);
        if class.keywords.is_empty() && plain_bases && class.bases.len() < 3 {
            for base in &class.bases {
                self.visit_expr(base)?;
            }
            self.add_op_arg(Opcode::CallFunction, 2 + to_i32(class.bases.len()));
        } else {
            self.collect_into_array(&class.bases, CollectionBits::OBJECT, 2)?;
            if class.keywords.is_empty() {
                self.add_op(Opcode::CallFunctionVarargs);
            } else {
                self.collect_keywords(&class.keywords)?;
                self.add_op(Opcode::CallFunctionKw);
            }
        }
        for _ in &class.decorators {
            self.add_op_arg(Opcode::CallFunction, 1);
        }
        self.with_location(class.binding.position, |this| this.name_op(&class.binding.name, NameCtx::Store))
    }

    /// Pushes the defaults arrays of a signature and returns the matching
    /// `MakeFunctionFlags`.
    fn collect_defaults(&mut self, params: &'a Parameters) -> Result<u8, CompileError> {
        let mut flags = 0;
        let defaults: Vec<&'a ExprLoc> = params.positional_defaults().collect();
        if !defaults.is_empty() {
            let mut collector = Collector::new(CollectionBits::OBJECT, self.batch_size(), 0);
            for default in defaults {
                self.visit_expr(default)?;
                collector.append_item(self.unit());
            }
            collector.finish(self.unit());
            flags |= MakeFunctionFlags::HAS_DEFAULTS;
        }
        let kw_defaults: Vec<_> = params.kwonly_defaults().collect();
        if !kw_defaults.is_empty() {
            let mut collector = Collector::new(CollectionBits::KWORDS, self.batch_size(), 0);
            for (name, default) in kw_defaults {
                self.visit_expr(default)?;
                self.add_constant_op(Opcode::MakeKeyword, Constant::Str(name.name.clone()));
                collector.append_item(self.unit());
            }
            collector.finish(self.unit());
            flags |= MakeFunctionFlags::HAS_KWONLY_DEFAULTS;
        }
        Ok(flags)
    }

    /// Creates a function object from a finished code unit, capturing its free
    /// variables from the current scope.
    fn make_closure(&mut self, code: CodeUnit, mut flags: u8) {
        if !code.freevars.is_empty() {
            for free in &code.freevars {
                let unit = self.unit();
                let from_cell = (unit.kind == UnitKind::Class && free == CLASS_CELL)
                    || unit.scope.get(free) == Some(SymbolKind::Cell);
                let index = if from_cell {
                    unit.cell_index(free)
                } else {
                    unit.free_index(free)
                };
                self.add_op_arg(Opcode::LoadClosure, index);
            }
            self.add_op_arg(Opcode::ClosureFromStack, to_i32(code.freevars.len()));
            flags |= MakeFunctionFlags::HAS_CLOSURE;
        }
        let index = self.unit().add_constant(Constant::Code(Box::new(code)));
        self.add_op_following(Opcode::MakeFunction, index, flags);
    }

    // === Expressions ===

    fn visit_expr(&mut self, expr: &'a ExprLoc) -> Result<(), CompileError> {
        self.enter_nesting(expr.position)?;
        let result = self.with_location(expr.position, |this| this.visit_expr_impl(expr));
        self.depth -= 1;
        result
    }

    fn visit_expr_impl(&mut self, expr: &'a ExprLoc) -> Result<(), CompileError> {
        let range = expr.position;
        match &expr.expr {
            Expr::Literal(literal) => {
                self.load_literal(literal);
                Ok(())
            }
            Expr::Name(name) => self.name_op(name, NameCtx::Load),
            Expr::BoolOp { op, values } => {
                let end = self.new_block();
                let jump = match op {
                    BoolOperator::And => Opcode::JumpIfFalseOrPop,
                    BoolOperator::Or => Opcode::JumpIfTrueOrPop,
                };
                let (last, rest) = values.split_last().expect("boolean operation has operands");
                for value in rest {
                    self.visit_expr(value)?;
                    self.add_jump(jump, end);
                }
                self.visit_expr(last)?;
                self.use_next_block(end);
                Ok(())
            }
            Expr::Op { left, op, right } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
                self.add_op_arg(Opcode::BinaryOp, binary_op(*op) as i32);
                Ok(())
            }
            Expr::UnaryOp { op, operand } => {
                self.visit_expr(operand)?;
                let op = match op {
                    UnaryOperator::Not => UnaryOp::Not,
                    UnaryOperator::Invert => UnaryOp::Invert,
                    UnaryOperator::UAdd => UnaryOp::Positive,
                    UnaryOperator::USub => UnaryOp::Negative,
                };
                self.add_op_arg(Opcode::UnaryOp, op as i32);
                Ok(())
            }
            Expr::Compare { left, comparisons } => self.visit_compare(left, comparisons),
            Expr::Call { func, args, keywords } => self.visit_call(func, args, keywords),
            Expr::Attribute { value, attr } => {
                self.visit_expr(value)?;
                let index = self.unit().name_index(attr);
                self.add_op_arg(Opcode::LoadAttr, index);
                Ok(())
            }
            Expr::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_expr(slice)?;
                self.add_op(Opcode::BinarySubscr);
                Ok(())
            }
            Expr::Slice { lower, upper, step } => {
                for bound in [lower, upper] {
                    match bound {
                        Some(bound) => self.visit_expr(bound)?,
                        None => self.add_op(Opcode::LoadNone),
                    }
                }
                let mut count = 2;
                if let Some(step) = step {
                    self.visit_expr(step)?;
                    count += 1;
                }
                self.add_op_arg(Opcode::BuildSlice, count);
                Ok(())
            }
            Expr::Starred(_) => Err(CompileError::syntax("can't use starred expression here", range)),
            Expr::List(elements) => self.collect_into_array(elements, CollectionBits::LIST, 0),
            Expr::Set(elements) => self.collect_into_array(elements, CollectionBits::SET, 0),
            Expr::Tuple(elements) => {
                if elements.iter().any(is_starred) || elements.len() > usize::from(self.batch_size()) {
                    self.collect_into_array(elements, CollectionBits::LIST, 0)?;
                    self.add_op_arg(Opcode::CollectionFromCollection, CollectionBits::TUPLE);
                    Ok(())
                } else {
                    self.collect_into_array(elements, CollectionBits::TUPLE, 0)
                }
            }
            Expr::Dict(items) => self.collect_into_dict(items),
            Expr::IfElse { test, body, orelse } => {
                let end = self.new_block();
                let alternative = self.new_block();
                self.jump_if(test, alternative, false)?;
                self.visit_expr(body)?;
                self.add_jump(Opcode::JumpForward, end);
                self.use_next_block(alternative);
                self.visit_expr(orelse)?;
                self.use_next_block(end);
                Ok(())
            }
            Expr::Named { target, value } => {
                self.visit_expr(value)?;
                self.add_op(Opcode::DupTop);
                self.with_location(target.position, |this| this.name_op(&target.name, NameCtx::Store))
            }
            Expr::Lambda(lambda) => self.visit_lambda(lambda, range),
            Expr::Comp(comp) => self.visit_comprehension(comp, range),
        }
    }

    fn load_literal(&mut self, literal: &Literal) {
        match literal {
            Literal::None => self.add_op(Opcode::LoadNone),
            Literal::Ellipsis => self.add_op(Opcode::LoadEllipsis),
            Literal::Bool(true) => self.add_op(Opcode::LoadTrue),
            Literal::Bool(false) => self.add_op(Opcode::LoadFalse),
            Literal::Int(value) => self.add_load_long(*value),
            Literal::BigInt(value) => self.add_constant_op(Opcode::LoadBigint, Constant::BigInt(value.clone())),
            Literal::Float(value) => {
                let index = self.unit().add_primitive(value.to_bits());
                self.add_op_arg(Opcode::LoadDouble, index);
            }
            Literal::Complex { real, imag } => self.add_constant_op(
                Opcode::LoadComplex,
                Constant::Complex {
                    real: *real,
                    imag: *imag,
                },
            ),
            Literal::Str(value) => self.add_constant_op(Opcode::LoadString, Constant::Str(value.clone())),
            Literal::Bytes(value) => self.add_constant_op(Opcode::LoadBytes, Constant::Bytes(value.clone())),
        }
    }

    /// Evaluates `test` and jumps to `target` when its truth equals `jump_if_true`.
    ///
    /// `not` flips the sense instead of computing a value, and `and`/`or`
    /// operands jump straight to their destination.
    fn jump_if(&mut self, test: &'a ExprLoc, target: BlockId, jump_if_true: bool) -> Result<(), CompileError> {
        match &test.expr {
            Expr::UnaryOp {
                op: UnaryOperator::Not,
                operand,
            } => self.jump_if(operand, target, !jump_if_true),
            Expr::BoolOp { op, values } => {
                let is_or = *op == BoolOperator::Or;
                let (last, rest) = values.split_last().expect("boolean operation has operands");
                if is_or == jump_if_true {
                    // any operand deciding the outcome jumps to target
                    for value in rest {
                        self.jump_if(value, target, jump_if_true)?;
                    }
                    self.jump_if(last, target, jump_if_true)
                } else {
                    let next = self.new_block();
                    for value in rest {
                        self.jump_if(value, next, !jump_if_true)?;
                    }
                    self.jump_if(last, target, jump_if_true)?;
                    self.use_next_block(next);
                    Ok(())
                }
            }
            _ => {
                self.visit_expr(test)?;
                let jump = if jump_if_true {
                    Opcode::PopAndJumpIfTrue
                } else {
                    Opcode::PopAndJumpIfFalse
                };
                self.with_location(test.position, |this| this.add_jump(jump, target));
                Ok(())
            }
        }
    }

    fn visit_compare(&mut self, left: &'a ExprLoc, comparisons: &'a [(CmpOperator, ExprLoc)]) -> Result<(), CompileError> {
        self.visit_expr(left)?;
        let ((last_op, last), rest) = comparisons.split_last().expect("comparison has operands");
        if rest.is_empty() {
            self.visit_expr(last)?;
            self.add_compare_op(*last_op);
            return Ok(());
        }
        let cleanup = self.new_block();
        let end = self.new_block();
        for (op, comparator) in rest {
            self.visit_expr(comparator)?;
            self.add_op(Opcode::DupTop);
            self.add_op(Opcode::RotThree);
            self.add_compare_op(*op);
            self.add_jump(Opcode::JumpIfFalseOrPop, cleanup);
        }
        self.visit_expr(last)?;
        self.add_compare_op(*last_op);
        self.add_jump(Opcode::JumpForward, end);
        self.use_next_block(cleanup);
        self.add_op(Opcode::RotTwo);
        self.add_op(Opcode::PopTop);
        self.use_next_block(end);
        Ok(())
    }

    fn add_compare_op(&mut self, op: CmpOperator) {
        let (binary, negate) = match op {
            CmpOperator::Eq => (BinaryOp::Eq, false),
            CmpOperator::NotEq => (BinaryOp::Ne, false),
            CmpOperator::Lt => (BinaryOp::Lt, false),
            CmpOperator::LtE => (BinaryOp::Le, false),
            CmpOperator::Gt => (BinaryOp::Gt, false),
            CmpOperator::GtE => (BinaryOp::Ge, false),
            CmpOperator::Is => (BinaryOp::Is, false),
            CmpOperator::IsNot => (BinaryOp::Is, true),
            CmpOperator::In => (BinaryOp::In, false),
            CmpOperator::NotIn => (BinaryOp::In, true),
        };
        self.add_op_arg(Opcode::BinaryOp, binary as i32);
        if negate {
            self.add_op_arg(Opcode::UnaryOp, UnaryOp::Not as i32);
        }
    }

    fn visit_call(&mut self, func: &'a ExprLoc, args: &'a [ExprLoc], keywords: &'a [Keyword]) -> Result<(), CompileError> {
        let plain_args = !args.iter().any(is_starred);
        if let Expr::Attribute { value, attr } = &func.expr
            && keywords.is_empty()
        {
            self.visit_expr(value)?;
            let name = self.unit().name_index(attr);
            if plain_args && args.len() <= MAX_SHORT_METHOD_ARGS {
                for arg in args {
                    self.visit_expr(arg)?;
                }
                self.add_op_following(Opcode::CallMethod, name, u8::try_from(args.len()).unwrap_or(u8::MAX));
            } else {
                self.collect_into_array(args, CollectionBits::OBJECT, 1)?;
                self.add_op_arg(Opcode::CallMethodVarargs, name);
            }
            return Ok(());
        }

        self.visit_expr(func)?;
        if plain_args && keywords.is_empty() && args.len() <= MAX_SHORT_CALL_ARGS {
            for arg in args {
                self.visit_expr(arg)?;
            }
            self.add_op_arg(Opcode::CallFunction, to_i32(args.len()));
            return Ok(());
        }
        self.collect_into_array(args, CollectionBits::OBJECT, 0)?;
        if keywords.is_empty() {
            self.add_op(Opcode::CallFunctionVarargs);
        } else {
            self.collect_keywords(keywords)?;
            self.add_op(Opcode::CallFunctionKw);
        }
        Ok(())
    }

    fn collect_into_array(&mut self, elements: &'a [ExprLoc], type_bits: i32, already_on_stack: i32) -> Result<(), CompileError> {
        let mut collector = Collector::new(type_bits, self.batch_size(), already_on_stack);
        for element in elements {
            if let Expr::Starred(inner) = &element.expr {
                collector.flush_if_necessary(self.unit());
                self.visit_expr(inner)?;
                collector.append_collection(self.unit());
            } else {
                self.visit_expr(element)?;
                collector.append_item(self.unit());
            }
        }
        collector.finish(self.unit());
        Ok(())
    }

    fn collect_into_dict(&mut self, items: &'a [DictItem]) -> Result<(), CompileError> {
        let mut collector = Collector::new(CollectionBits::DICT, self.batch_size(), 0);
        for item in items {
            match &item.key {
                Some(key) => {
                    self.visit_expr(key)?;
                    self.visit_expr(&item.value)?;
                    collector.append_item(self.unit());
                }
                None => {
                    collector.flush_if_necessary(self.unit());
                    self.visit_expr(&item.value)?;
                    collector.append_collection(self.unit());
                }
            }
        }
        collector.finish(self.unit());
        Ok(())
    }

    /// Pushes the keyword array of a call.
    fn collect_keywords(&mut self, keywords: &'a [Keyword]) -> Result<(), CompileError> {
        let mut seen = AHashSet::new();
        for keyword in keywords {
            if let Some(arg) = &keyword.arg
                && !seen.insert(arg.name.as_str())
            {
                return Err(CompileError::syntax(
                    format!("keyword argument repeated: {}", arg.name),
                    keyword.position,
                ));
            }
        }

        let has_splat = keywords.iter().any(|keyword| keyword.arg.is_none());
        if !has_splat {
            let mut collector = Collector::new(CollectionBits::KWORDS, self.batch_size(), 0);
            for keyword in keywords {
                self.visit_expr(&keyword.value)?;
                let name = keyword.arg.as_ref().map(|arg| arg.name.clone()).unwrap_or_default();
                self.with_location(keyword.position, |this| {
                    this.add_constant_op(Opcode::MakeKeyword, Constant::Str(name));
                });
                collector.append_item(self.unit());
            }
            collector.finish(self.unit());
        } else if let [only] = keywords {
            self.visit_expr(&only.value)?;
            self.add_op_arg(Opcode::CollectionFromCollection, CollectionBits::KWORDS);
        } else {
            // an intermediate dict rejects duplicate keys coming from the splats
            let mut collector = Collector::kwargs_merging(self.batch_size());
            for keyword in keywords {
                match &keyword.arg {
                    None => {
                        collector.flush_if_necessary(self.unit());
                        self.visit_expr(&keyword.value)?;
                        collector.append_collection(self.unit());
                    }
                    Some(arg) => {
                        self.add_constant_op(Opcode::LoadString, Constant::Str(arg.name.clone()));
                        self.visit_expr(&keyword.value)?;
                        collector.append_item(self.unit());
                    }
                }
            }
            collector.finish(self.unit());
            self.add_op_arg(Opcode::CollectionFromCollection, CollectionBits::KWORDS);
        }
        Ok(())
    }

    fn visit_lambda(&mut self, lambda: &'a Lambda, range: CodeRange) -> Result<(), CompileError> {
        let flags = self.collect_defaults(&lambda.params)?;
        self.enter_scope(lambda.scope, UnitKind::Lambda, "<lambda>", range);
        self.set_arg_counts(&lambda.params);
        self.visit_expr(&lambda.body)?;
        self.add_op(Opcode::ReturnValue);
        let code = self.exit_scope()?;
        self.make_closure(code, flags);
        Ok(())
    }

    fn visit_comprehension(&mut self, comp: &'a Comp, range: CodeRange) -> Result<(), CompileError> {
        let (name, type_bits) = match comp.kind {
            CompKind::List => ("<listcomp>", CollectionBits::LIST),
            CompKind::Set => ("<setcomp>", CollectionBits::SET),
            CompKind::Dict => ("<dictcomp>", CollectionBits::DICT),
        };
        // distance from the innermost element down to the accumulator
        let depth = comp.generators.len() + 1 + usize::from(comp.kind == CompKind::Dict);
        if to_i32(depth) > CollectionBits::MAX_STACK_ELEMENT_COUNT {
            return Err(CompileError::syntax("too many levels of nested comprehensions", range));
        }

        self.enter_scope(comp.scope, UnitKind::Comprehension, name, range);
        debug_assert_eq!(self.unit_ref().scope.kind(), ScopeKind::Comprehension);
        self.unit().argcount = 1;
        self.add_op_arg(Opcode::CollectionFromStack, type_bits);
        self.visit_comp_generator(comp, 0, type_bits | to_i32(depth))?;
        self.add_op(Opcode::ReturnValue);
        let code = self.exit_scope()?;

        self.make_closure(code, 0);
        self.visit_expr(&comp.generators[0].iter)?;
        self.add_op(Opcode::GetIter);
        self.add_op_arg(Opcode::CallFunction, 1);
        Ok(())
    }

    fn visit_comp_generator(&mut self, comp: &'a Comp, index: usize, add_arg: i32) -> Result<(), CompileError> {
        let generator = &comp.generators[index];
        let start = self.new_block();
        let if_cleanup = self.new_block();
        let anchor = self.new_block();
        if index == 0 {
            // the outermost iterator is passed in as the only argument
            self.name_op(COMPREHENSION_ITER, NameCtx::Load)?;
        } else {
            self.visit_expr(&generator.iter)?;
            self.add_op(Opcode::GetIter);
        }
        self.use_next_block(start);
        self.add_jump(Opcode::ForIter, anchor);
        self.visit_store(&generator.target)?;
        for condition in &generator.ifs {
            self.jump_if(condition, if_cleanup, false)?;
        }
        if index + 1 < comp.generators.len() {
            self.visit_comp_generator(comp, index + 1, add_arg)?;
        } else {
            self.visit_expr(&comp.element)?;
            if let Some(value) = &comp.value {
                self.visit_expr(value)?;
            }
            self.add_op_arg(Opcode::AddToCollection, add_arg);
        }
        self.use_next_block(if_cleanup);
        self.add_jump(Opcode::JumpBackward, start);
        self.use_next_block(anchor);
        Ok(())
    }
}

fn is_starred(expr: &ExprLoc) -> bool {
    matches!(expr.expr, Expr::Starred(_))
}

fn binary_op(op: Operator) -> BinaryOp {
    match op {
        Operator::Add => BinaryOp::Add,
        Operator::Sub => BinaryOp::Sub,
        Operator::Mult => BinaryOp::Mul,
        Operator::MatMult => BinaryOp::Matmul,
        Operator::Div => BinaryOp::Truediv,
        Operator::Mod => BinaryOp::Mod,
        Operator::Pow => BinaryOp::Pow,
        Operator::LShift => BinaryOp::Lshift,
        Operator::RShift => BinaryOp::Rshift,
        Operator::BitOr => BinaryOp::Or,
        Operator::BitXor => BinaryOp::Xor,
        Operator::BitAnd => BinaryOp::And,
        Operator::FloorDiv => BinaryOp::Floordiv,
    }
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).expect("count exceeds i32")
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).expect("count exceeds u32")
}
