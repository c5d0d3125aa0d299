//! Lowering of expression trees into opcode programs.
//!
//! Specializations, in priority order:
//!
//! 1. constant sub-expressions are folded at compile time;
//! 2. `x = <number>` becomes `NumberEquals`;
//! 3. `x = '<string>'` becomes `StringEquals`;
//! 4. `starts-with(x, '<string>')` becomes `StartsWithLiteral`;
//! 5. `[n]` becomes an ordinal on the step (forward mode) or a
//!    `PositionEquals` predicate (inverse mode);
//! 6. anything else is a generic `Relational`.
//!
//! Booleans outside predicates run over a single item and compile to
//! short-circuit jumps. Inside predicates they run over every candidate node
//! at once and compile to `StartBoolean`/`ApplyBoolean`/`EndBoolean`.

use crate::ast::{Expr, Function, MathOp, RelOp, Step, ValueType};
use crate::opcode::{BooleanOp, FilterId, Opcode, Program};
use crate::value::{atom_number, compare_atoms};
use crate::{FilterError, Value};

/// Deepest allowed nesting of predicates.
pub const MAX_PREDICATE_DEPTH: usize = 3;

/// How a program will be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// A single query evaluated on its own.
    #[default]
    Forward,
    /// One of many filters merged into a [`FilterTable`](crate::FilterTable).
    /// Positional predicates stay explicit so their opcodes can be shared.
    Inverse,
}

pub(crate) struct Compiler {
    program: Program,
    mode: CompileMode,
    depth: usize,
    needs_context: bool,
}

impl Compiler {
    pub fn new(mode: CompileMode) -> Self {
        Self {
            program: Program::new(),
            mode,
            depth: 0,
            needs_context: false,
        }
    }

    /// Compile a query that leaves its result on the stack.
    pub fn compile_query(mut self, expr: &Expr) -> Result<(Program, ValueType), FilterError> {
        let result_type = self.expr(expr)?;
        self.program.set_needs_context(self.needs_context);
        Ok((self.program, result_type))
    }

    /// Compile a filter that reports `id` when it holds.
    pub fn compile_filter(mut self, expr: &Expr, id: FilterId) -> Result<Program, FilterError> {
        let result_type = self.expr(expr)?;
        self.coerce_boolean(result_type);
        self.emit(Opcode::MatchFilter(id));
        self.program.set_needs_context(self.needs_context);
        Ok(self.program)
    }

    fn emit(&mut self, op: Opcode) {
        self.program.append(op);
    }

    fn expr(&mut self, expr: &Expr) -> Result<ValueType, FilterError> {
        if let Some(value) = fold(expr) {
            return Ok(self.literal(value));
        }
        match expr {
            Expr::And(left, right) => self.boolean(BooleanOp::And, left, right),
            Expr::Or(left, right) => self.boolean(BooleanOp::Or, left, right),
            Expr::Relational { op, left, right } => self.relational(*op, left, right),
            Expr::Math { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.emit(Opcode::Math(*op));
                Ok(ValueType::Number)
            }
            Expr::Negate(inner) => {
                self.expr(inner)?;
                self.emit(Opcode::Negate);
                Ok(ValueType::Number)
            }
            Expr::Number(n) => Ok(self.literal(Value::Number(*n))),
            Expr::String(s) => Ok(self.literal(Value::String(s.clone()))),
            Expr::Function { function, args } => self.function(*function, args),
            Expr::Union(left, right) => {
                self.node_set(left)?;
                self.node_set(right)?;
                self.emit(Opcode::Union);
                Ok(ValueType::NodeSet)
            }
            Expr::LocationPath(path) => {
                if path.absolute {
                    self.emit(Opcode::SelectRoot);
                } else {
                    self.context_node();
                }
                self.steps(&path.steps)?;
                Ok(ValueType::NodeSet)
            }
            Expr::RelativePath { base, path } => {
                self.node_set(base)?;
                self.steps(&path.steps)?;
                Ok(ValueType::NodeSet)
            }
            Expr::Filter { base, predicates } => {
                self.node_set(base)?;
                self.predicates(predicates)?;
                Ok(ValueType::NodeSet)
            }
            Expr::Variable(name) => {
                self.emit(Opcode::Variable(name.clone()));
                Ok(ValueType::Any)
            }
            Expr::ExternalFunction { name, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.emit(Opcode::ExternalFunction {
                    name: name.clone(),
                    argc: args.len(),
                });
                Ok(ValueType::Any)
            }
        }
    }

    fn literal(&mut self, value: Value) -> ValueType {
        match value {
            Value::Boolean(b) => {
                self.emit(Opcode::PushBool(b));
                ValueType::Boolean
            }
            Value::Number(n) => {
                self.emit(Opcode::PushNumber(n));
                ValueType::Number
            }
            Value::String(s) => {
                self.emit(Opcode::PushString(s));
                ValueType::String
            }
            Value::NodeSet(_) => ValueType::NodeSet,
        }
    }

    fn coerce_boolean(&mut self, value_type: ValueType) {
        if value_type != ValueType::Boolean {
            self.emit(Opcode::Function {
                function: Function::Boolean,
                argc: 1,
            });
        }
    }

    fn node_set(&mut self, expr: &Expr) -> Result<(), FilterError> {
        match self.expr(expr)? {
            ValueType::NodeSet | ValueType::Any => Ok(()),
            other => Err(FilterError::TypeMismatch(format!(
                "expected a node-set, found {other:?}"
            ))),
        }
    }

    /// Paths relative to the caller's context node only make the program
    /// depend on that node outside predicates.
    fn context_node(&mut self) {
        if self.depth == 0 {
            self.needs_context = true;
        }
        self.emit(Opcode::PushContextNode);
    }

    fn boolean(&mut self, op: BooleanOp, left: &Expr, right: &Expr) -> Result<ValueType, FilterError> {
        if self.depth == 0 {
            let mut operands = Vec::new();
            flatten(op, left, &mut operands);
            flatten(op, right, &mut operands);

            let end = self.program.allocate(Opcode::BlockEnd);
            let last = operands.len() - 1;
            for (i, operand) in operands.into_iter().enumerate() {
                let operand_type = self.expr(operand)?;
                if i < last {
                    self.emit(match op {
                        BooleanOp::And => Opcode::JumpIfFalse { target: end },
                        BooleanOp::Or => Opcode::JumpIfTrue { target: end },
                    });
                } else {
                    self.coerce_boolean(operand_type);
                }
            }
            self.program.link(end);
        } else {
            self.expr(left)?;
            let end = self.program.allocate(Opcode::EndBoolean);
            self.emit(Opcode::StartBoolean { op, end });
            self.expr(right)?;
            self.emit(Opcode::ApplyBoolean);
            self.program.link(end);
        }
        Ok(ValueType::Boolean)
    }

    fn relational(&mut self, op: RelOp, left: &Expr, right: &Expr) -> Result<ValueType, FilterError> {
        let specialized = match (op, fold(left), fold(right)) {
            (RelOp::Eq, _, Some(literal)) => Some((left, literal)),
            (RelOp::Eq, Some(literal), _) => Some((right, literal)),
            _ => None,
        };
        match specialized {
            Some((operand, Value::Number(n))) => {
                self.expr(operand)?;
                self.emit(Opcode::NumberEquals(n));
            }
            Some((operand, Value::String(s))) => {
                self.expr(operand)?;
                self.emit(Opcode::StringEquals(s));
            }
            _ => {
                self.expr(left)?;
                self.expr(right)?;
                self.emit(Opcode::Relational(op));
            }
        }
        Ok(ValueType::Boolean)
    }

    fn function(&mut self, function: Function, args: &[Expr]) -> Result<ValueType, FilterError> {
        function.check_arity(args.len())?;

        if function == Function::StartsWith {
            if let (Some(subject), Some(Value::String(prefix))) =
                (args.first(), args.get(1).and_then(fold))
            {
                self.expr(subject)?;
                self.emit(Opcode::StartsWithLiteral(prefix));
                return Ok(ValueType::Boolean);
            }
        }

        for arg in args {
            let arg_type = self.expr(arg)?;
            if function.wants_node_set() && !matches!(arg_type, ValueType::NodeSet | ValueType::Any)
            {
                return Err(FilterError::TypeMismatch(format!(
                    "{}() expects a node-set, found {arg_type:?}",
                    function.name()
                )));
            }
        }
        let reads_context_node = args.is_empty()
            && matches!(
                function,
                Function::String
                    | Function::StringLength
                    | Function::LocalName
                    | Function::Name
                    | Function::Number
                    | Function::NormalizeSpace
            );
        if reads_context_node && self.depth == 0 {
            self.needs_context = true;
        }
        self.emit(Opcode::Function {
            function,
            argc: args.len(),
        });
        Ok(function.result_type())
    }

    fn steps(&mut self, steps: &[Step]) -> Result<(), FilterError> {
        for step in steps {
            let mut predicates = step.predicates.as_slice();
            let mut ordinal = None;
            if self.mode == CompileMode::Forward {
                if let Some((first, rest)) = predicates.split_first() {
                    if let Some(n) = ordinal_of(first) {
                        self.check_depth(self.depth + 1)?;
                        ordinal = Some(n);
                        predicates = rest;
                    }
                }
            }
            self.emit(Opcode::Select {
                axis: step.axis,
                test: step.test.clone(),
                ordinal,
                grouped: !predicates.is_empty(),
            });
            if !predicates.is_empty() {
                self.predicates(predicates)?;
            }
        }
        Ok(())
    }

    fn predicates(&mut self, predicates: &[Expr]) -> Result<(), FilterError> {
        self.check_depth(self.depth + 1)?;
        self.depth += 1;
        let last = predicates.len().saturating_sub(1);
        for (i, predicate) in predicates.iter().enumerate() {
            self.emit(Opcode::BeginPredicate);
            match (self.mode, ordinal_of(predicate)) {
                (CompileMode::Inverse, Some(n)) => self.emit(Opcode::PositionEquals(n)),
                _ => {
                    self.expr(predicate)?;
                }
            }
            self.emit(Opcode::EndPredicate { merge: i == last });
        }
        self.depth -= 1;
        Ok(())
    }

    fn check_depth(&self, depth: usize) -> Result<(), FilterError> {
        if depth > MAX_PREDICATE_DEPTH {
            return Err(FilterError::PredicateDepthExceeded {
                max: MAX_PREDICATE_DEPTH,
            });
        }
        Ok(())
    }
}

fn flatten<'e>(op: BooleanOp, expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match (op, expr) {
        (BooleanOp::And, Expr::And(left, right)) | (BooleanOp::Or, Expr::Or(left, right)) => {
            flatten(op, left, out);
            flatten(op, right, out);
        }
        _ => out.push(expr),
    }
}

/// `[n]` for a positive integer `n`.
fn ordinal_of(predicate: &Expr) -> Option<usize> {
    match fold(predicate)? {
        Value::Number(n) if n >= 1.0 && n.fract() == 0.0 && n < u32::MAX as f64 => {
            Some(n as usize)
        }
        _ => None,
    }
}

/// Evaluate `expr` at compile time if it does not depend on the document.
pub(crate) fn fold(expr: &Expr) -> Option<Value> {
    Some(match expr {
        Expr::Number(n) => Value::Number(*n),
        Expr::String(s) => Value::String(s.clone()),
        Expr::Negate(inner) => Value::Number(-atom_number(&fold(inner)?)),
        Expr::Math { op, left, right } => {
            let (l, r) = (fold(left)?, fold(right)?);
            Value::Number(fold_math(*op, &l, &r))
        }
        Expr::Relational { op, left, right } => {
            Value::Boolean(compare_atoms(*op, &fold(left)?, &fold(right)?))
        }
        Expr::And(left, right) => {
            Value::Boolean(fold(left)?.to_boolean() && fold(right)?.to_boolean())
        }
        Expr::Or(left, right) => {
            Value::Boolean(fold(left)?.to_boolean() || fold(right)?.to_boolean())
        }
        Expr::Function { function, args } => match (function, args.as_slice()) {
            (Function::True, []) => Value::Boolean(true),
            (Function::False, []) => Value::Boolean(false),
            (Function::Not, [arg]) => Value::Boolean(!fold(arg)?.to_boolean()),
            (Function::Boolean, [arg]) => Value::Boolean(fold(arg)?.to_boolean()),
            _ => return None,
        },
        _ => return None,
    })
}

fn fold_math(op: MathOp, left: &Value, right: &Value) -> f64 {
    op.apply(atom_number(left), atom_number(right))
}
