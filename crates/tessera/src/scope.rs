//! Scope analysis: classifies every name of every scope before compilation.
//!
//! The analysis runs in two passes over the tree produced by [`crate::parse`]:
//!
//! 1. A collecting pass records, per scope, how each name is used (bound,
//!    read, declared `global`/`nonlocal`, a parameter) and which scopes nest
//!    inside it.
//! 2. A resolving pass walks the scope tree top down with the set of names
//!    bound by enclosing function scopes, classifies every name and propagates
//!    free variables back up so that enclosing scopes turn the captured locals
//!    into cells.
//!
//! The compiler consumes the result without further checks. Asking for a name
//! the analysis never saw is a compiler bug and panics.

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::{
    ast::{
        Comp, Comprehension, DictItem, Expr, ExprLoc, Identifier, Keyword, Module, Parameters, ScopeId, Stmt, StmtLoc,
    },
    error::CompileError,
    location::CodeRange,
};

/// Name of the implicit cell holding the class object for zero-argument `super()`.
pub const CLASS_CELL: &str = "__class__";
/// Name of the synthetic parameter carrying a comprehension's outermost iterator.
pub const COMPREHENSION_ITER: &str = ".0";

/// The kind of lexical scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Module,
    Function,
    Lambda,
    Class,
    Comprehension,
}

impl ScopeKind {
    /// Whether locals of this scope live in fast slots.
    #[must_use]
    pub fn is_function_like(self) -> bool {
        matches!(self, Self::Function | Self::Lambda | Self::Comprehension)
    }
}

/// How a name is bound within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Bound in this scope and not captured by any nested scope.
    Local,
    /// Bound in this scope and captured by a nested scope.
    Cell,
    /// Bound in an enclosing function scope.
    Free,
    /// Not bound anywhere visible; resolved at runtime in globals, then builtins.
    GlobalImplicit,
    /// Declared `global`.
    GlobalExplicit,
    /// Bound in a class body while a method captures the same name from the
    /// function enclosing the class. The class body uses the name dictionary,
    /// the class unit still carries the name as a free variable.
    DefFreeClass,
}

/// Per-name usage collected in the first pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Usage(u8);

impl Usage {
    const BOUND: u8 = 0x01;
    const PARAM: u8 = 0x02;
    const GLOBAL: u8 = 0x04;
    const NONLOCAL: u8 = 0x08;
    const USED: u8 = 0x10;
    /// A `:=` target inside a comprehension, bound by the enclosing function.
    const COMP_FREE: u8 = 0x20;

    fn has(self, bits: u8) -> bool {
        self.0 & bits != 0
    }
}

/// Everything known about one scope after analysis.
#[derive(Debug, Clone)]
pub struct Scope {
    kind: ScopeKind,
    name: String,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    /// Usage flags in first-seen order.
    usages: IndexMap<String, Usage>,
    params: Vec<String>,
    /// Where each `nonlocal` name was declared, for error reporting.
    nonlocal_positions: AHashMap<String, CodeRange>,
    /// Classification of every name, filled by the resolving pass.
    symbols: AHashMap<String, SymbolKind>,
    needs_class_closure: bool,
    /// Whether this scope is a `def`/`class` whose name its parent declares `global`.
    declared_global: bool,
}

impl Scope {
    fn new(kind: ScopeKind, name: impl Into<String>, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent,
            children: Vec::new(),
            usages: IndexMap::new(),
            params: Vec::new(),
            nonlocal_positions: AHashMap::new(),
            symbols: AHashMap::new(),
            needs_class_closure: false,
            declared_global: false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    #[must_use]
    pub fn is_function_like(&self) -> bool {
        self.kind.is_function_like()
    }

    /// Whether a class body must create the `__class__` cell.
    #[must_use]
    pub fn needs_class_closure(&self) -> bool {
        self.needs_class_closure
    }

    /// Whether the scope's own name is declared `global` in its parent, which
    /// keeps its qualified name unprefixed.
    #[must_use]
    pub fn is_declared_global(&self) -> bool {
        self.declared_global
    }

    /// Classification of `name`, if the analysis saw it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SymbolKind> {
        self.symbols.get(name).copied()
    }

    /// Classification of `name`.
    ///
    /// # Panics
    /// Panics when the name was never recorded for this scope.
    #[must_use]
    pub fn lookup(&self, name: &str) -> SymbolKind {
        match self.get(name) {
            Some(kind) => kind,
            None => panic!("scope analysis has no classification for '{name}' in '{}'", self.name),
        }
    }

    /// Parameter names in slot order.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Cell variable names: `__class__` first when the class closure is needed,
    /// then the remaining cells in sorted order.
    #[must_use]
    pub fn cellvars(&self) -> Vec<&str> {
        let mut cells: Vec<&str> = self
            .symbols
            .iter()
            .filter(|(name, kind)| **kind == SymbolKind::Cell && !(self.needs_class_closure && *name == CLASS_CELL))
            .map(|(name, _)| name.as_str())
            .collect();
        cells.sort_unstable();
        if self.needs_class_closure {
            cells.insert(0, CLASS_CELL);
        }
        cells
    }

    /// Free variable names in sorted order.
    #[must_use]
    pub fn freevars(&self) -> Vec<&str> {
        let mut frees: Vec<&str> = self
            .symbols
            .iter()
            .filter(|(_, kind)| matches!(kind, SymbolKind::Free | SymbolKind::DefFreeClass))
            .map(|(name, _)| name.as_str())
            .collect();
        frees.sort_unstable();
        frees
    }

    fn note(&mut self, name: &str, bits: u8) -> Usage {
        let usage = self.usages.entry(name.to_owned()).or_default();
        usage.0 |= bits;
        *usage
    }
}

/// Result of scope analysis for one module.
#[derive(Debug, Clone)]
pub struct ScopeAnalysis {
    scopes: Vec<Scope>,
}

impl ScopeAnalysis {
    /// Analyzes every scope of `module`.
    ///
    /// # Errors
    /// Returns a syntax error for misplaced or conflicting `global`/`nonlocal`
    /// declarations and for invalid `:=` targets in comprehensions.
    pub fn analyze(module: &Module) -> Result<Self, CompileError> {
        let mut collector = Collector {
            scopes: (0..module.scope_count).map(|_| None).collect(),
            stack: Vec::new(),
        };
        collector.enter(ScopeId::MODULE, Scope::new(ScopeKind::Module, "<module>", None));
        if module.body.first().is_some_and(is_docstring) {
            collector.bind("__doc__");
        }
        collector.visit_body(&module.body)?;
        collector.stack.pop();

        let mut scopes: Vec<Scope> = collector
            .scopes
            .into_iter()
            .enumerate()
            .map(|(index, scope)| match scope {
                Some(scope) => scope,
                None => panic!("scope {index} was allocated by the parser but never visited"),
            })
            .collect();
        resolve(&mut scopes, ScopeId::MODULE, &AHashSet::new())?;
        Ok(Self { scopes })
    }

    /// The scope with the given id.
    #[must_use]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

fn is_docstring(stmt: &StmtLoc) -> bool {
    matches!(&stmt.stmt, Stmt::Expr(expr) if expr.is_str_literal())
}

/// First pass: records usages per scope.
struct Collector {
    scopes: Vec<Option<Scope>>,
    /// Scopes currently being visited, innermost last.
    stack: Vec<ScopeId>,
}

impl Collector {
    fn enter(&mut self, id: ScopeId, scope: Scope) {
        if let Some(&parent) = self.stack.last() {
            self.scope_mut(parent).children.push(id);
        }
        self.scopes[id.index()] = Some(scope);
        self.stack.push(id);
    }

    fn current_id(&self) -> ScopeId {
        *self.stack.last().expect("collector always has an active scope")
    }

    fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        self.scopes[id.index()]
            .as_mut()
            .expect("scope is entered before it is used")
    }

    fn current(&mut self) -> &mut Scope {
        let id = self.current_id();
        self.scope_mut(id)
    }

    fn bind(&mut self, name: &str) {
        self.current().note(name, Usage::BOUND);
    }

    fn use_name(&mut self, name: &str) {
        let scope = self.current();
        scope.note(name, Usage::USED);
        if name == "super" && scope.kind.is_function_like() {
            scope.note(CLASS_CELL, Usage::USED);
        }
    }

    fn add_param(&mut self, name: &str) {
        let scope = self.current();
        scope.note(name, Usage::PARAM);
        scope.params.push(name.to_owned());
    }

    fn visit_body(&mut self, body: &[StmtLoc]) -> Result<(), CompileError> {
        for stmt in body {
            self.visit_stmt(stmt)?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &StmtLoc) -> Result<(), CompileError> {
        match &stmt.stmt {
            Stmt::Pass | Stmt::Break | Stmt::Continue => {}
            Stmt::Expr(expr) => self.visit_expr(expr)?,
            Stmt::Return(value) => self.visit_opt_expr(value.as_ref())?,
            Stmt::Raise { exc, cause } => {
                self.visit_opt_expr(exc.as_ref())?;
                self.visit_opt_expr(cause.as_ref())?;
            }
            Stmt::Assert { test, msg } => {
                self.visit_expr(test)?;
                self.visit_opt_expr(msg.as_ref())?;
            }
            Stmt::Assign { targets, value } => {
                self.visit_expr(value)?;
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            Stmt::AugAssign { target, value, .. } => {
                self.visit_expr(value)?;
                if let Expr::Name(name) = &target.expr {
                    self.use_name(name);
                }
                self.visit_target(target)?;
            }
            Stmt::Delete(targets) => {
                for target in targets {
                    self.visit_target(target)?;
                }
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.visit_expr(iter)?;
                self.visit_target(target)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            Stmt::While { test, body, orelse } | Stmt::If { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_body(body)?;
                self.visit_body(orelse)?;
            }
            Stmt::With { items, body } => {
                for item in items {
                    self.visit_expr(&item.context)?;
                    if let Some(target) = &item.target {
                        self.visit_target(target)?;
                    }
                }
                self.visit_body(body)?;
            }
            Stmt::Try(try_stmt) => {
                self.visit_body(&try_stmt.body)?;
                for handler in &try_stmt.handlers {
                    self.visit_opt_expr(handler.exc_type.as_ref())?;
                    if let Some(name) = &handler.name {
                        self.bind(&name.name);
                    }
                    self.visit_body(&handler.body)?;
                }
                self.visit_body(&try_stmt.orelse)?;
                self.visit_body(&try_stmt.finalbody)?;
            }
            Stmt::FunctionDef(def) => {
                for decorator in &def.decorators {
                    self.visit_expr(decorator)?;
                }
                self.visit_defaults(&def.params)?;
                let declared_global = self.is_declared_global(&def.binding.name);
                self.bind(&def.binding.name);
                let mut scope = Scope::new(ScopeKind::Function, def.name.clone(), Some(self.current_id()));
                scope.declared_global = declared_global;
                self.enter(def.scope, scope);
                self.add_params(&def.params);
                self.visit_body(&def.body)?;
                self.stack.pop();
            }
            Stmt::ClassDef(class) => {
                for decorator in &class.decorators {
                    self.visit_expr(decorator)?;
                }
                for base in &class.bases {
                    self.visit_expr(base)?;
                }
                self.visit_keywords(&class.keywords)?;
                let declared_global = self.is_declared_global(&class.binding.name);
                self.bind(&class.binding.name);
                let mut scope = Scope::new(ScopeKind::Class, class.name.clone(), Some(self.current_id()));
                scope.declared_global = declared_global;
                self.enter(class.scope, scope);
                self.use_name("__name__");
                for implicit in ["__module__", "__qualname__", "__classcell__"] {
                    self.bind(implicit);
                }
                if class.body.first().is_some_and(is_docstring) {
                    self.bind("__doc__");
                }
                self.visit_body(&class.body)?;
                self.stack.pop();
            }
            Stmt::Global(names) => {
                for ident in names {
                    self.declare_global(ident)?;
                }
            }
            Stmt::Nonlocal(names) => {
                for ident in names {
                    self.declare_nonlocal(ident)?;
                }
            }
            Stmt::Import(aliases) => {
                for alias in aliases {
                    let bound = match &alias.asname {
                        Some(asname) => asname.as_str(),
                        None => alias.name.split('.').next().unwrap_or(&alias.name),
                    };
                    self.bind(bound);
                }
            }
            Stmt::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name == "*" {
                        if self.current().kind != ScopeKind::Module {
                            return Err(CompileError::syntax(
                                "import * only allowed at module level",
                                alias.position,
                            ));
                        }
                        continue;
                    }
                    self.bind(alias.asname.as_deref().unwrap_or(&alias.name));
                }
            }
        }
        Ok(())
    }

    fn is_declared_global(&mut self, name: &str) -> bool {
        self.current().usages.get(name).is_some_and(|usage| usage.has(Usage::GLOBAL))
    }

    fn declare_global(&mut self, ident: &Identifier) -> Result<(), CompileError> {
        let name = &ident.name;
        let scope = self.current();
        if let Some(usage) = scope.usages.get(name).copied() {
            if usage.has(Usage::PARAM) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is parameter and global"),
                    ident.position,
                ));
            }
            if usage.has(Usage::NONLOCAL) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is nonlocal and global"),
                    ident.position,
                ));
            }
            if usage.has(Usage::BOUND) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is assigned to before global declaration"),
                    ident.position,
                ));
            }
            if usage.has(Usage::USED) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is used prior to global declaration"),
                    ident.position,
                ));
            }
        }
        scope.note(name, Usage::GLOBAL);
        Ok(())
    }

    fn declare_nonlocal(&mut self, ident: &Identifier) -> Result<(), CompileError> {
        let name = &ident.name;
        let scope = self.current();
        if scope.kind == ScopeKind::Module {
            return Err(CompileError::syntax(
                "nonlocal declaration not allowed at module level",
                ident.position,
            ));
        }
        if let Some(usage) = scope.usages.get(name).copied() {
            if usage.has(Usage::PARAM) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is parameter and nonlocal"),
                    ident.position,
                ));
            }
            if usage.has(Usage::GLOBAL) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is nonlocal and global"),
                    ident.position,
                ));
            }
            if usage.has(Usage::BOUND) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is assigned to before nonlocal declaration"),
                    ident.position,
                ));
            }
            if usage.has(Usage::USED) {
                return Err(CompileError::syntax(
                    format!("name '{name}' is used prior to nonlocal declaration"),
                    ident.position,
                ));
            }
        }
        scope.note(name, Usage::NONLOCAL);
        scope.nonlocal_positions.insert(name.clone(), ident.position);
        Ok(())
    }

    fn visit_defaults(&mut self, params: &Parameters) -> Result<(), CompileError> {
        for default in params.positional_defaults() {
            self.visit_expr(default)?;
        }
        for (_, default) in params.kwonly_defaults() {
            self.visit_expr(default)?;
        }
        Ok(())
    }

    fn add_params(&mut self, params: &Parameters) {
        for ident in params.identifiers() {
            self.add_param(&ident.name);
        }
    }

    fn visit_keywords(&mut self, keywords: &[Keyword]) -> Result<(), CompileError> {
        for keyword in keywords {
            self.visit_expr(&keyword.value)?;
        }
        Ok(())
    }

    fn visit_opt_expr(&mut self, expr: Option<&ExprLoc>) -> Result<(), CompileError> {
        match expr {
            Some(expr) => self.visit_expr(expr),
            None => Ok(()),
        }
    }

    fn visit_exprs(&mut self, exprs: &[ExprLoc]) -> Result<(), CompileError> {
        for expr in exprs {
            self.visit_expr(expr)?;
        }
        Ok(())
    }

    /// Visits an assignment or deletion target.
    fn visit_target(&mut self, target: &ExprLoc) -> Result<(), CompileError> {
        match &target.expr {
            Expr::Name(name) => {
                self.bind(name);
                Ok(())
            }
            Expr::Tuple(elements) | Expr::List(elements) => {
                for element in elements {
                    self.visit_target(element)?;
                }
                Ok(())
            }
            Expr::Starred(inner) => self.visit_target(inner),
            // attribute and subscript targets only read names
            _ => self.visit_expr(target),
        }
    }

    fn visit_expr(&mut self, expr: &ExprLoc) -> Result<(), CompileError> {
        match &expr.expr {
            Expr::Literal(_) => {}
            Expr::Name(name) => self.use_name(name),
            Expr::BoolOp { values, .. } => self.visit_exprs(values)?,
            Expr::Op { left, right, .. } => {
                self.visit_expr(left)?;
                self.visit_expr(right)?;
            }
            Expr::UnaryOp { operand, .. } => self.visit_expr(operand)?,
            Expr::Compare { left, comparisons } => {
                self.visit_expr(left)?;
                for (_, comparator) in comparisons {
                    self.visit_expr(comparator)?;
                }
            }
            Expr::Call { func, args, keywords } => {
                self.visit_expr(func)?;
                self.visit_exprs(args)?;
                self.visit_keywords(keywords)?;
            }
            Expr::Attribute { value, .. } | Expr::Starred(value) => self.visit_expr(value)?,
            Expr::Subscript { value, slice } => {
                self.visit_expr(value)?;
                self.visit_expr(slice)?;
            }
            Expr::Slice { lower, upper, step } => {
                self.visit_opt_expr(lower.as_deref())?;
                self.visit_opt_expr(upper.as_deref())?;
                self.visit_opt_expr(step.as_deref())?;
            }
            Expr::List(elements) | Expr::Tuple(elements) | Expr::Set(elements) => self.visit_exprs(elements)?,
            Expr::Dict(items) => {
                for DictItem { key, value } in items {
                    self.visit_opt_expr(key.as_ref())?;
                    self.visit_expr(value)?;
                }
            }
            Expr::IfElse { test, body, orelse } => {
                self.visit_expr(test)?;
                self.visit_expr(body)?;
                self.visit_expr(orelse)?;
            }
            Expr::Named { target, value } => {
                self.visit_expr(value)?;
                self.bind_named_target(target)?;
            }
            Expr::Lambda(lambda) => {
                self.visit_defaults(&lambda.params)?;
                let scope = Scope::new(ScopeKind::Lambda, "<lambda>", Some(self.current_id()));
                self.enter(lambda.scope, scope);
                self.add_params(&lambda.params);
                self.visit_expr(&lambda.body)?;
                self.stack.pop();
            }
            Expr::Comp(comp) => self.visit_comprehension(comp)?,
        }
        Ok(())
    }

    fn visit_comprehension(&mut self, comp: &Comp) -> Result<(), CompileError> {
        let (first, rest) = comp
            .generators
            .split_first()
            .expect("parser produces at least one generator");
        // the outermost iterable is evaluated in the enclosing scope
        self.visit_expr(&first.iter)?;
        let name = match comp.kind {
            crate::ast::CompKind::List => "<listcomp>",
            crate::ast::CompKind::Set => "<setcomp>",
            crate::ast::CompKind::Dict => "<dictcomp>",
        };
        let scope = Scope::new(ScopeKind::Comprehension, name, Some(self.current_id()));
        self.enter(comp.scope, scope);
        self.add_param(COMPREHENSION_ITER);
        self.visit_generator_clauses(first)?;
        for generator in rest {
            self.visit_expr(&generator.iter)?;
            self.visit_generator_clauses(generator)?;
        }
        self.visit_expr(&comp.element)?;
        self.visit_opt_expr(comp.value.as_ref())?;
        self.stack.pop();
        Ok(())
    }

    fn visit_generator_clauses(&mut self, generator: &Comprehension) -> Result<(), CompileError> {
        self.visit_target(&generator.target)?;
        self.visit_exprs(&generator.ifs)
    }

    /// Binds a `:=` target. Inside comprehensions the target belongs to the
    /// nearest enclosing non-comprehension scope.
    fn bind_named_target(&mut self, target: &Identifier) -> Result<(), CompileError> {
        let name = &target.name;
        let current = self.current_id();
        if self.scope_mut(current).kind != ScopeKind::Comprehension {
            self.bind(name);
            return Ok(());
        }
        let mut crossed = Vec::new();
        for &id in self.stack.iter().rev() {
            let scope = self.scopes[id.index()]
                .as_ref()
                .expect("scopes on the stack are entered");
            if scope.kind != ScopeKind::Comprehension {
                break;
            }
            if scope.usages.get(name).is_some_and(|usage| usage.has(Usage::BOUND)) {
                return Err(CompileError::syntax(
                    format!("assignment expression cannot rebind comprehension iteration variable '{name}'"),
                    target.position,
                ));
            }
            crossed.push(id);
        }
        let owner = self.stack[self.stack.len() - crossed.len() - 1];
        let owner_kind = self.scope_mut(owner).kind;
        let comp_bits = match owner_kind {
            ScopeKind::Class => {
                return Err(CompileError::syntax(
                    "assignment expression within a comprehension cannot be used in a class body",
                    target.position,
                ));
            }
            ScopeKind::Module => Usage::GLOBAL,
            _ => Usage::COMP_FREE,
        };
        for id in crossed {
            self.scope_mut(id).note(name, comp_bits);
        }
        self.scope_mut(owner).note(name, Usage::BOUND);
        Ok(())
    }
}

/// Second pass: classifies the names of `id` and its descendants.
///
/// `bound` holds names bound by enclosing function scopes. Returns the names
/// this scope needs from its enclosing scopes.
fn resolve(scopes: &mut [Scope], id: ScopeId, bound: &AHashSet<String>) -> Result<AHashSet<String>, CompileError> {
    let kind = scopes[id.index()].kind;
    let mut locals = AHashSet::new();
    let mut symbols = AHashMap::new();
    let mut free = AHashSet::new();

    for (name, usage) in &scopes[id.index()].usages {
        let symbol = if usage.has(Usage::GLOBAL) {
            SymbolKind::GlobalExplicit
        } else if usage.has(Usage::NONLOCAL) {
            if !bound.contains(name) {
                let position = scopes[id.index()]
                    .nonlocal_positions
                    .get(name)
                    .copied()
                    .unwrap_or_default();
                return Err(CompileError::syntax(
                    format!("no binding for nonlocal '{name}' found"),
                    position,
                ));
            }
            free.insert(name.clone());
            SymbolKind::Free
        } else if usage.has(Usage::COMP_FREE) {
            free.insert(name.clone());
            SymbolKind::Free
        } else if usage.has(Usage::BOUND | Usage::PARAM) {
            locals.insert(name.clone());
            SymbolKind::Local
        } else if bound.contains(name) && kind != ScopeKind::Module {
            free.insert(name.clone());
            SymbolKind::Free
        } else {
            SymbolKind::GlobalImplicit
        };
        symbols.insert(name.clone(), symbol);
    }

    let child_bound: AHashSet<String> = match kind {
        ScopeKind::Module => AHashSet::new(),
        ScopeKind::Class => {
            let mut names = bound.clone();
            names.insert(CLASS_CELL.to_owned());
            names
        }
        _ => bound
            .iter()
            .filter(|name| symbols.get(*name) != Some(&SymbolKind::GlobalExplicit))
            .chain(&locals)
            .cloned()
            .collect(),
    };

    let mut child_free = AHashSet::new();
    let children = scopes[id.index()].children.clone();
    for child in children {
        child_free.extend(resolve(scopes, child, &child_bound)?);
    }

    let scope = &mut scopes[id.index()];
    if kind == ScopeKind::Class && child_free.remove(CLASS_CELL) {
        scope.needs_class_closure = true;
        symbols.insert(CLASS_CELL.to_owned(), SymbolKind::Cell);
    }
    for name in child_free {
        match symbols.get(&name).copied() {
            Some(SymbolKind::Local) if kind.is_function_like() => {
                symbols.insert(name, SymbolKind::Cell);
            }
            Some(SymbolKind::Cell) if kind.is_function_like() => {}
            Some(SymbolKind::Local | SymbolKind::GlobalImplicit) if kind == ScopeKind::Class => {
                // the class binds the name itself but a method reaches past it
                symbols.insert(name.clone(), SymbolKind::DefFreeClass);
                free.insert(name);
            }
            Some(SymbolKind::GlobalExplicit) => {}
            Some(SymbolKind::Free | SymbolKind::DefFreeClass) => {
                free.insert(name);
            }
            _ => {
                if kind != ScopeKind::Module {
                    symbols.insert(name.clone(), SymbolKind::Free);
                    free.insert(name);
                }
            }
        }
    }
    scope.symbols = symbols;
    Ok(free)
}
