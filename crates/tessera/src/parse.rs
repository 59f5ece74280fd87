//! Conversion from the ruff syntax tree to [`crate::ast`].
//!
//! The conversion mangles class-private names, folds `elif` chains, numbers
//! scopes and rejects constructs the compiler does not lower. Recursion is
//! bounded by the configured nesting depth.

use std::borrow::Cow;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use ruff_python_ast::{
    self as ast, BoolOp, CmpOp, ElifElseClause, Expr as AstExpr, Number, Operator as AstOperator, ParameterWithDefault,
    Stmt as AstStmt, UnaryOp as AstUnaryOp,
};
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};

use crate::{
    ast::{
        Alias, BoolOperator, ClassDef, CmpOperator, Comp, CompKind, Comprehension, DictItem, ExceptHandler, Expr,
        ExprLoc, FunctionDef, Identifier, Keyword, Lambda, Literal, Module, Operator, Param, Parameters, ScopeId, Stmt,
        StmtLoc, Try, UnaryOperator, WithItem,
    },
    error::CompileError,
    location::LineIndex,
    options::CompileOptions,
};

/// Parses `source` into a [`Module`].
///
/// # Errors
/// Returns `CompileError::Syntax` for invalid source, `NotSupported` for
/// constructs the compiler does not handle and `ResourceLimit` when nesting
/// exceeds `options.get_max_nesting_depth()`.
pub fn parse(source: &str, options: &CompileOptions) -> Result<Module, CompileError> {
    let mut parser = Parser::new(source, options.get_max_nesting_depth());
    let parsed = parse_module(source)
        .map_err(|e| CompileError::syntax(e.error.to_string(), parser.lines.range(e.range())))?;
    let module = parsed.into_syntax();
    let body = parser.parse_statements(module.body)?;
    Ok(Module {
        body,
        scope_count: parser.next_scope,
        position: parser.lines.range(module.range),
    })
}

struct Parser {
    lines: LineIndex,
    /// Enclosing class names, innermost last, for private name mangling.
    class_stack: Vec<String>,
    /// Remaining nesting budget; an error is returned when it runs out.
    depth_remaining: u16,
    next_scope: u32,
}

impl Parser {
    fn new(source: &str, max_depth: u16) -> Self {
        Self {
            lines: LineIndex::new(source),
            class_stack: Vec::new(),
            depth_remaining: max_depth,
            // scope 0 is the module
            next_scope: 1,
        }
    }

    fn new_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.next_scope);
        self.next_scope += 1;
        id
    }

    fn parse_statements(&mut self, statements: Vec<AstStmt>) -> Result<Vec<StmtLoc>, CompileError> {
        statements.into_iter().map(|s| self.parse_statement(s)).collect()
    }

    fn parse_elif_else_clauses(&mut self, clauses: Vec<ElifElseClause>) -> Result<Vec<StmtLoc>, CompileError> {
        let mut tail = Vec::new();
        for clause in clauses.into_iter().rev() {
            let position = self.lines.range(clause.range);
            match clause.test {
                Some(test) => {
                    let test = self.parse_expression(test)?;
                    let body = self.parse_statements(clause.body)?;
                    tail = vec![StmtLoc::new(position, Stmt::If { test, body, orelse: tail })];
                }
                None => tail = self.parse_statements(clause.body)?,
            }
        }
        Ok(tail)
    }

    fn parse_statement(&mut self, statement: AstStmt) -> Result<StmtLoc, CompileError> {
        self.decr_depth_remaining(|| statement.range())?;
        let result = self.parse_statement_impl(statement);
        self.depth_remaining += 1;
        result
    }

    fn parse_statement_impl(&mut self, statement: AstStmt) -> Result<StmtLoc, CompileError> {
        let position = self.lines.range(statement.range());
        let stmt = match statement {
            AstStmt::FunctionDef(function) => {
                if function.is_async {
                    return Err(CompileError::not_supported("async def", position));
                }
                let decorators = self.parse_decorators(function.decorator_list)?;
                let params = self.parse_parameters(&function.parameters)?;
                let scope = self.new_scope();
                let body = self.parse_statements(function.body)?;
                Stmt::FunctionDef(Box::new(FunctionDef {
                    scope,
                    name: function.name.id.to_string(),
                    binding: self.identifier(function.name.as_str(), function.name.range),
                    params,
                    body,
                    decorators,
                }))
            }
            AstStmt::ClassDef(class) => {
                let decorators = self.parse_decorators(class.decorator_list)?;
                let (bases, keywords) = match class.arguments {
                    Some(arguments) => {
                        let ast::Arguments { args, keywords, .. } = *arguments;
                        let bases = args
                            .into_vec()
                            .into_iter()
                            .map(|e| self.parse_expression(e))
                            .collect::<Result<Vec<_>, _>>()?;
                        (bases, self.parse_keywords(keywords.into_vec())?)
                    }
                    None => (Vec::new(), Vec::new()),
                };
                let binding = self.identifier(class.name.as_str(), class.name.range);
                let scope = self.new_scope();
                self.class_stack.push(class.name.id.to_string());
                let body = self.parse_statements(class.body);
                self.class_stack.pop();
                Stmt::ClassDef(Box::new(ClassDef {
                    scope,
                    name: class.name.id.to_string(),
                    binding,
                    bases,
                    keywords,
                    body: body?,
                    decorators,
                }))
            }
            AstStmt::Return(ast::StmtReturn { value, .. }) => {
                Stmt::Return(value.map(|v| self.parse_expression(*v)).transpose()?)
            }
            AstStmt::Delete(ast::StmtDelete { targets, .. }) => Stmt::Delete(
                targets
                    .into_iter()
                    .map(|t| self.parse_expression(t))
                    .collect::<Result<_, _>>()?,
            ),
            AstStmt::Assign(ast::StmtAssign { targets, value, .. }) => Stmt::Assign {
                targets: targets
                    .into_iter()
                    .map(|t| self.parse_expression(t))
                    .collect::<Result<_, _>>()?,
                value: self.parse_expression(*value)?,
            },
            AstStmt::AugAssign(ast::StmtAugAssign { target, op, value, .. }) => Stmt::AugAssign {
                target: self.parse_expression(*target)?,
                op: convert_op(op),
                value: self.parse_expression(*value)?,
            },
            AstStmt::AnnAssign(_) => return Err(CompileError::not_supported("annotated assignment", position)),
            AstStmt::TypeAlias(_) => return Err(CompileError::not_supported("type alias statement", position)),
            AstStmt::For(ast::StmtFor {
                is_async,
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                if is_async {
                    return Err(CompileError::not_supported("async for", position));
                }
                Stmt::For {
                    target: self.parse_expression(*target)?,
                    iter: self.parse_expression(*iter)?,
                    body: self.parse_statements(body)?,
                    orelse: self.parse_statements(orelse)?,
                }
            }
            AstStmt::While(ast::StmtWhile { test, body, orelse, .. }) => Stmt::While {
                test: self.parse_expression(*test)?,
                body: self.parse_statements(body)?,
                orelse: self.parse_statements(orelse)?,
            },
            AstStmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => Stmt::If {
                test: self.parse_expression(*test)?,
                body: self.parse_statements(body)?,
                orelse: self.parse_elif_else_clauses(elif_else_clauses)?,
            },
            AstStmt::With(ast::StmtWith {
                is_async, items, body, ..
            }) => {
                if is_async {
                    return Err(CompileError::not_supported("async with", position));
                }
                let items = items
                    .into_iter()
                    .map(|item| {
                        Ok(WithItem {
                            context: self.parse_expression(item.context_expr)?,
                            target: item.optional_vars.map(|v| self.parse_expression(*v)).transpose()?,
                        })
                    })
                    .collect::<Result<_, CompileError>>()?;
                Stmt::With {
                    items,
                    body: self.parse_statements(body)?,
                }
            }
            AstStmt::Match(_) => return Err(CompileError::not_supported("match statement", position)),
            AstStmt::Raise(ast::StmtRaise { exc, cause, .. }) => Stmt::Raise {
                exc: exc.map(|e| self.parse_expression(*e)).transpose()?,
                cause: cause.map(|e| self.parse_expression(*e)).transpose()?,
            },
            AstStmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
                ..
            }) => {
                if is_star {
                    return Err(CompileError::not_supported("try* statement", position));
                }
                Stmt::Try(Box::new(Try {
                    body: self.parse_statements(body)?,
                    handlers: handlers
                        .into_iter()
                        .map(|h| self.parse_except_handler(h))
                        .collect::<Result<_, _>>()?,
                    orelse: self.parse_statements(orelse)?,
                    finalbody: self.parse_statements(finalbody)?,
                }))
            }
            AstStmt::Assert(ast::StmtAssert { test, msg, .. }) => Stmt::Assert {
                test: self.parse_expression(*test)?,
                msg: msg.map(|m| self.parse_expression(*m)).transpose()?,
            },
            AstStmt::Import(ast::StmtImport { names, .. }) => {
                Stmt::Import(names.iter().map(|alias| self.alias(alias)).collect())
            }
            AstStmt::ImportFrom(ast::StmtImportFrom {
                module, names, level, ..
            }) => Stmt::ImportFrom {
                module: module.map(|m| m.id.to_string()),
                names: names.iter().map(|alias| self.alias(alias)).collect(),
                level,
            },
            AstStmt::Global(ast::StmtGlobal { names, .. }) => Stmt::Global(
                names
                    .iter()
                    .map(|id| self.identifier(id.as_str(), id.range))
                    .collect(),
            ),
            AstStmt::Nonlocal(ast::StmtNonlocal { names, .. }) => Stmt::Nonlocal(
                names
                    .iter()
                    .map(|id| self.identifier(id.as_str(), id.range))
                    .collect(),
            ),
            AstStmt::Expr(ast::StmtExpr { value, .. }) => Stmt::Expr(self.parse_expression(*value)?),
            AstStmt::Pass(_) => Stmt::Pass,
            AstStmt::Break(_) => Stmt::Break,
            AstStmt::Continue(_) => Stmt::Continue,
            AstStmt::IpyEscapeCommand(_) => {
                return Err(CompileError::not_supported("IPython escape commands", position));
            }
        };
        Ok(StmtLoc::new(position, stmt))
    }

    fn parse_except_handler(&mut self, handler: ast::ExceptHandler) -> Result<ExceptHandler, CompileError> {
        let ast::ExceptHandler::ExceptHandler(h) = handler;
        Ok(ExceptHandler {
            position: self.lines.range(h.range),
            exc_type: h.type_.map(|t| self.parse_expression(*t)).transpose()?,
            name: h.name.map(|n| self.identifier(n.as_str(), n.range)),
            body: self.parse_statements(h.body)?,
        })
    }

    fn parse_decorators(&mut self, decorators: Vec<ast::Decorator>) -> Result<Vec<ExprLoc>, CompileError> {
        decorators
            .into_iter()
            .map(|d| self.parse_expression(d.expression))
            .collect()
    }

    /// Converts a signature. Annotations are dropped.
    fn parse_parameters(&mut self, params: &ast::Parameters) -> Result<Parameters, CompileError> {
        Ok(Parameters {
            posonly: self.parse_params_with_defaults(&params.posonlyargs)?,
            args: self.parse_params_with_defaults(&params.args)?,
            vararg: params
                .vararg
                .as_ref()
                .map(|p| self.identifier(p.name.as_str(), p.name.range)),
            kwonly: self.parse_params_with_defaults(&params.kwonlyargs)?,
            kwarg: params
                .kwarg
                .as_ref()
                .map(|p| self.identifier(p.name.as_str(), p.name.range)),
        })
    }

    fn parse_params_with_defaults(&mut self, params: &[ParameterWithDefault]) -> Result<Vec<Param>, CompileError> {
        params
            .iter()
            .map(|p| {
                let name = self.identifier(p.parameter.name.as_str(), p.parameter.name.range);
                let default = match &p.default {
                    Some(expr) => Some(self.parse_expression((**expr).clone())?),
                    None => None,
                };
                Ok(Param { name, default })
            })
            .collect()
    }

    fn parse_keywords(&mut self, keywords: Vec<ast::Keyword>) -> Result<Vec<Keyword>, CompileError> {
        keywords
            .into_iter()
            .map(|kw| {
                Ok(Keyword {
                    // keyword names are never mangled
                    arg: kw.arg.map(|a| Identifier::new(a.as_str(), self.lines.range(a.range))),
                    value: self.parse_expression(kw.value)?,
                    position: self.lines.range(kw.range),
                })
            })
            .collect()
    }

    fn parse_comprehension_generators(
        &mut self,
        generators: Vec<ast::Comprehension>,
    ) -> Result<Vec<Comprehension>, CompileError> {
        generators
            .into_iter()
            .map(|comp| {
                if comp.is_async {
                    return Err(CompileError::not_supported(
                        "async comprehension",
                        self.lines.range(comp.range),
                    ));
                }
                Ok(Comprehension {
                    target: self.parse_expression(comp.target)?,
                    iter: self.parse_expression(comp.iter)?,
                    ifs: comp
                        .ifs
                        .into_iter()
                        .map(|cond| self.parse_expression(cond))
                        .collect::<Result<_, _>>()?,
                })
            })
            .collect()
    }

    fn parse_comprehension(
        &mut self,
        kind: CompKind,
        element: AstExpr,
        value: Option<AstExpr>,
        generators: Vec<ast::Comprehension>,
    ) -> Result<Expr, CompileError> {
        let scope = self.new_scope();
        let element = self.parse_expression(element)?;
        let value = value.map(|v| self.parse_expression(v)).transpose()?;
        let generators = self.parse_comprehension_generators(generators)?;
        Ok(Expr::Comp(Box::new(Comp {
            scope,
            kind,
            element,
            value,
            generators,
        })))
    }

    fn parse_expressions(&mut self, expressions: Vec<AstExpr>) -> Result<Vec<ExprLoc>, CompileError> {
        expressions.into_iter().map(|e| self.parse_expression(e)).collect()
    }

    fn parse_expression(&mut self, expression: AstExpr) -> Result<ExprLoc, CompileError> {
        self.decr_depth_remaining(|| expression.range())?;
        let result = self.parse_expression_impl(expression);
        self.depth_remaining += 1;
        result
    }

    fn parse_expression_impl(&mut self, expression: AstExpr) -> Result<ExprLoc, CompileError> {
        let position = self.lines.range(expression.range());
        let expr = match expression {
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, .. }) => Expr::BoolOp {
                op: match op {
                    BoolOp::And => BoolOperator::And,
                    BoolOp::Or => BoolOperator::Or,
                },
                values: self.parse_expressions(values)?,
            },
            AstExpr::Named(ast::ExprNamed { target, value, .. }) => {
                let AstExpr::Name(ast::ExprName { id, range, .. }) = *target else {
                    return Err(CompileError::syntax(
                        "assignment expression target must be a name",
                        position,
                    ));
                };
                Expr::Named {
                    target: self.identifier(&id, range),
                    value: Box::new(self.parse_expression(*value)?),
                }
            }
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, .. }) => Expr::Op {
                left: Box::new(self.parse_expression(*left)?),
                op: convert_op(op),
                right: Box::new(self.parse_expression(*right)?),
            },
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => Expr::UnaryOp {
                op: match op {
                    AstUnaryOp::Not => UnaryOperator::Not,
                    AstUnaryOp::Invert => UnaryOperator::Invert,
                    AstUnaryOp::UAdd => UnaryOperator::UAdd,
                    AstUnaryOp::USub => UnaryOperator::USub,
                },
                operand: Box::new(self.parse_expression(*operand)?),
            },
            AstExpr::Lambda(ast::ExprLambda { parameters, body, .. }) => {
                let params = match parameters {
                    Some(params) => self.parse_parameters(&params)?,
                    None => Parameters::default(),
                };
                let scope = self.new_scope();
                let body = self.parse_expression(*body)?;
                Expr::Lambda(Box::new(Lambda { scope, params, body }))
            }
            AstExpr::If(ast::ExprIf { test, body, orelse, .. }) => Expr::IfElse {
                test: Box::new(self.parse_expression(*test)?),
                body: Box::new(self.parse_expression(*body)?),
                orelse: Box::new(self.parse_expression(*orelse)?),
            },
            AstExpr::Dict(ast::ExprDict { items, .. }) => Expr::Dict(
                items
                    .into_iter()
                    .map(|ast::DictItem { key, value }| {
                        Ok(DictItem {
                            key: key.map(|k| self.parse_expression(k)).transpose()?,
                            value: self.parse_expression(value)?,
                        })
                    })
                    .collect::<Result<_, CompileError>>()?,
            ),
            AstExpr::Set(ast::ExprSet { elts, .. }) => Expr::Set(self.parse_expressions(elts)?),
            AstExpr::ListComp(ast::ExprListComp { elt, generators, .. }) => {
                self.parse_comprehension(CompKind::List, *elt, None, generators)?
            }
            AstExpr::SetComp(ast::ExprSetComp { elt, generators, .. }) => {
                self.parse_comprehension(CompKind::Set, *elt, None, generators)?
            }
            AstExpr::DictComp(ast::ExprDictComp {
                key, value, generators, ..
            }) => self.parse_comprehension(CompKind::Dict, *key, Some(*value), generators)?,
            AstExpr::Generator(_) => return Err(CompileError::not_supported("generator expression", position)),
            AstExpr::Await(_) => return Err(CompileError::not_supported("await expression", position)),
            AstExpr::Yield(_) => return Err(CompileError::not_supported("yield expression", position)),
            AstExpr::YieldFrom(_) => return Err(CompileError::not_supported("yield from expression", position)),
            AstExpr::Compare(ast::ExprCompare {
                left, ops, comparators, ..
            }) => {
                let left = Box::new(self.parse_expression(*left)?);
                let comparisons = ops
                    .into_vec()
                    .into_iter()
                    .zip(comparators.into_vec())
                    .map(|(op, right)| Ok((convert_compare_op(op), self.parse_expression(right)?)))
                    .collect::<Result<_, CompileError>>()?;
                Expr::Compare { left, comparisons }
            }
            AstExpr::Call(ast::ExprCall { func, arguments, .. }) => {
                let func = Box::new(self.parse_expression(*func)?);
                let ast::Arguments { args, keywords, .. } = arguments;
                Expr::Call {
                    func,
                    args: self.parse_expressions(args.into_vec())?,
                    keywords: self.parse_keywords(keywords.into_vec())?,
                }
            }
            AstExpr::FString(_) => return Err(CompileError::not_supported("f-string", position)),
            AstExpr::TString(_) => return Err(CompileError::not_supported("t-string", position)),
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, .. }) => Expr::Literal(Literal::Str(value.to_string())),
            AstExpr::BytesLiteral(ast::ExprBytesLiteral { value, .. }) => {
                let bytes: Cow<'_, [u8]> = Cow::from(&value);
                Expr::Literal(Literal::Bytes(bytes.into_owned()))
            }
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => match value {
                Number::Int(i) => {
                    if let Some(i) = i.as_i64() {
                        Expr::Literal(Literal::Int(i))
                    } else {
                        let big = parse_int_literal(&i.to_string())
                            .ok_or_else(|| CompileError::syntax(format!("invalid integer literal: {i}"), position))?;
                        // ruff keeps some i64-sized literals (large radix forms) as strings
                        match big.to_i64() {
                            Some(small) => Expr::Literal(Literal::Int(small)),
                            None => Expr::Literal(Literal::BigInt(big)),
                        }
                    }
                }
                Number::Float(f) => Expr::Literal(Literal::Float(f)),
                Number::Complex { real, imag } => Expr::Literal(Literal::Complex { real, imag }),
            },
            AstExpr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => Expr::Literal(Literal::Bool(value)),
            AstExpr::NoneLiteral(_) => Expr::Literal(Literal::None),
            AstExpr::EllipsisLiteral(_) => Expr::Literal(Literal::Ellipsis),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Expr::Attribute {
                value: Box::new(self.parse_expression(*value)?),
                attr: self.maybe_mangle_name(attr.as_str()),
            },
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                let starred = match slice.as_ref() {
                    AstExpr::Starred(_) => true,
                    AstExpr::Tuple(t) => t.elts.iter().any(AstExpr::is_starred_expr),
                    _ => false,
                };
                if starred {
                    return Err(CompileError::not_supported("star expression in subscript", position));
                }
                Expr::Subscript {
                    value: Box::new(self.parse_expression(*value)?),
                    slice: Box::new(self.parse_expression(*slice)?),
                }
            }
            AstExpr::Starred(ast::ExprStarred { value, .. }) => Expr::Starred(Box::new(self.parse_expression(*value)?)),
            AstExpr::Name(ast::ExprName { id, .. }) => Expr::Name(self.maybe_mangle_name(&id)),
            AstExpr::List(ast::ExprList { elts, .. }) => Expr::List(self.parse_expressions(elts)?),
            AstExpr::Tuple(ast::ExprTuple { elts, .. }) => Expr::Tuple(self.parse_expressions(elts)?),
            AstExpr::Slice(ast::ExprSlice { lower, upper, step, .. }) => Expr::Slice {
                lower: lower.map(|e| self.parse_expression(*e).map(Box::new)).transpose()?,
                upper: upper.map(|e| self.parse_expression(*e).map(Box::new)).transpose()?,
                step: step.map(|e| self.parse_expression(*e).map(Box::new)).transpose()?,
            },
            AstExpr::IpyEscapeCommand(_) => {
                return Err(CompileError::not_supported("IPython escape commands", position));
            }
        };
        Ok(ExprLoc::new(position, expr))
    }

    fn alias(&self, alias: &ast::Alias) -> Alias {
        Alias {
            name: alias.name.id.to_string(),
            asname: alias.asname.as_ref().map(|a| self.maybe_mangle_name(a.as_str())),
            position: self.lines.range(alias.range),
        }
    }

    fn identifier(&self, name: &str, range: TextRange) -> Identifier {
        Identifier::new(self.maybe_mangle_name(name), self.lines.range(range))
    }

    /// Applies class-private mangling: `__x` inside class `_C` becomes `_C__x`.
    fn maybe_mangle_name(&self, name: &str) -> String {
        let Some(class_name) = self.class_stack.last() else {
            return name.to_owned();
        };
        if !is_mangling_candidate(name) {
            return name.to_owned();
        }
        let stripped = class_name.trim_start_matches('_');
        if stripped.is_empty() {
            return name.to_owned();
        }
        let mut mangled = String::with_capacity(1 + stripped.len() + name.len());
        mangled.push('_');
        mangled.push_str(stripped);
        mangled.push_str(name);
        mangled
    }

    /// Decrements the depth remaining for nested constructs.
    /// Returns an error if the depth remaining goes to zero.
    fn decr_depth_remaining(&mut self, get_range: impl FnOnce() -> TextRange) -> Result<(), CompileError> {
        if let Some(depth_remaining) = self.depth_remaining.checked_sub(1) {
            self.depth_remaining = depth_remaining;
            Ok(())
        } else {
            Err(CompileError::resource_limit(
                "too many nested parentheses",
                self.lines.range(get_range()),
            ))
        }
    }
}

fn convert_op(op: AstOperator) -> Operator {
    match op {
        AstOperator::Add => Operator::Add,
        AstOperator::Sub => Operator::Sub,
        AstOperator::Mult => Operator::Mult,
        AstOperator::MatMult => Operator::MatMult,
        AstOperator::Div => Operator::Div,
        AstOperator::Mod => Operator::Mod,
        AstOperator::Pow => Operator::Pow,
        AstOperator::LShift => Operator::LShift,
        AstOperator::RShift => Operator::RShift,
        AstOperator::BitOr => Operator::BitOr,
        AstOperator::BitXor => Operator::BitXor,
        AstOperator::BitAnd => Operator::BitAnd,
        AstOperator::FloorDiv => Operator::FloorDiv,
    }
}

fn convert_compare_op(op: CmpOp) -> CmpOperator {
    match op {
        CmpOp::Eq => CmpOperator::Eq,
        CmpOp::NotEq => CmpOperator::NotEq,
        CmpOp::Lt => CmpOperator::Lt,
        CmpOp::LtE => CmpOperator::LtE,
        CmpOp::Gt => CmpOperator::Gt,
        CmpOp::GtE => CmpOperator::GtE,
        CmpOp::Is => CmpOperator::Is,
        CmpOp::IsNot => CmpOperator::IsNot,
        CmpOp::In => CmpOperator::In,
        CmpOp::NotIn => CmpOperator::NotIn,
    }
}

/// Names starting with `__` and not ending with `__` are class-private.
fn is_mangling_candidate(name: &str) -> bool {
    name.starts_with("__") && !name.ends_with("__")
}

/// Parses an integer literal with optional radix prefix and `_` separators.
fn parse_int_literal(s: &str) -> Option<BigInt> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    if cleaned.len() >= 2 {
        let (prefix, digits) = cleaned.split_at(2);
        let radix = match prefix.to_ascii_lowercase().as_str() {
            "0x" => Some(16),
            "0o" => Some(8),
            "0b" => Some(2),
            _ => None,
        };
        if let Some(radix) = radix {
            return BigInt::parse_bytes(digits.as_bytes(), radix);
        }
    }
    cleaned.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        parse(source, &CompileOptions::default()).unwrap()
    }

    #[test]
    fn elif_chain_folds_into_nested_if() {
        let module = parse_ok("if a:\n    pass\nelif b:\n    pass\nelse:\n    x = 1\n");
        let Stmt::If { orelse, .. } = &module.body[0].stmt else {
            panic!("expected if");
        };
        let Stmt::If { orelse: inner, .. } = &orelse[0].stmt else {
            panic!("expected nested if");
        };
        assert!(matches!(inner[0].stmt, Stmt::Assign { .. }));
    }

    #[test]
    fn private_names_are_mangled_in_class_bodies() {
        let module = parse_ok("class _Foo:\n    __x = 1\n    def m(self):\n        return self.__y\n");
        let Stmt::ClassDef(class) = &module.body[0].stmt else {
            panic!("expected class");
        };
        let Stmt::Assign { targets, .. } = &class.body[0].stmt else {
            panic!("expected assign");
        };
        assert_eq!(targets[0].expr, Expr::Name("_Foo__x".to_owned()));
        let Stmt::FunctionDef(method) = &class.body[1].stmt else {
            panic!("expected def");
        };
        let Stmt::Return(Some(ret)) = &method.body[0].stmt else {
            panic!("expected return");
        };
        assert!(matches!(&ret.expr, Expr::Attribute { attr, .. } if attr == "_Foo__y"));
    }

    #[test]
    fn scopes_are_numbered_in_source_order() {
        let module = parse_ok("def f():\n    return [x for x in y]\nlambda: 1\n");
        assert_eq!(module.scope_count, 4);
        let Stmt::FunctionDef(f) = &module.body[0].stmt else {
            panic!("expected def");
        };
        assert_eq!(f.scope, ScopeId(1));
    }

    #[test]
    fn big_integers_keep_full_precision() {
        let module = parse_ok("0x1_0000_0000_0000_0000\n");
        let Stmt::Expr(expr) = &module.body[0].stmt else {
            panic!("expected expression");
        };
        assert_eq!(expr.expr, Expr::Literal(Literal::BigInt(BigInt::from(1u128 << 64))));
    }

    #[test]
    fn unsupported_constructs_are_named() {
        let err = parse("x = f'{y}'\n", &CompileOptions::default()).unwrap_err();
        assert_eq!(err.message(), "f-string is not supported");
        let err = parse("async def f():\n    pass\n", &CompileOptions::default()).unwrap_err();
        assert_eq!(err.message(), "async def is not supported");
    }

    #[test]
    fn deep_nesting_hits_resource_limit() {
        let source = format!("x = {}1{}\n", "[".repeat(64), "]".repeat(64));
        let options = CompileOptions::default().max_nesting_depth(20);
        let err = parse(&source, &options).unwrap_err();
        assert!(matches!(err, CompileError::ResourceLimit { .. }));
        assert_eq!(err.message(), "too many nested parentheses");
    }
}
