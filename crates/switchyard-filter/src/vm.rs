//! The filter VM.
//!
//! Evaluation is vectorized over context items. The context stack holds the
//! set of items the current code runs for: one item at the top level, one per
//! candidate node inside a predicate. Every value frame carries one value per
//! item of the innermost context, so a predicate body runs once for all of
//! its candidates:
//!
//! ```text
//!   /a/b[c = 1]
//!
//!   SelectRoot            frames: [ {/} ]                 contexts: [ top ]
//!   Select a              frames: [ {a} ]
//!   Select b grouped      frames: [ ((b1 b2)) ]
//!   BeginPredicate        frames: [ ]                     contexts: [ top, (b1 b2) ]
//!   PushContextNode       frames: [ {b1} {b2} ]
//!   Select c              frames: [ {c..} {c..} ]
//!   NumberEquals 1        frames: [ true false ]
//!   EndPredicate merge    frames: [ {b1} ]                contexts: [ top ]
//! ```
//!
//! Branches evaluate each alternative from a checkpoint of both stacks and
//! rewind afterwards; the last alternative runs on the live state. All
//! alternatives charge the same [`WorkCounter`].

use std::collections::HashMap;

use parking_lot::Mutex;
use switchyard_core::{Document, NodeId};

use crate::ast::{Axis, NodeTest, RelOp};
use crate::branch::BranchIndex;
use crate::functions::{self, CallContext};
use crate::interpreter::predicate_holds;
use crate::opcode::{BooleanOp, FilterId, Opcode, OpcodeId, Program};
use crate::resolve::{call_external, resolve_variable};
use crate::stack::BranchStack;
use crate::value::{compare, union_nodes};
use crate::{axis, FilterError, FunctionResolver, Value, VariableResolver, WorkCounter};

/// Per-opcode execution counts, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct ExecStats {
    counts: Mutex<HashMap<&'static str, usize>>,
}

impl ExecStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times opcodes named `op` ran.
    pub fn count(&self, op: &str) -> usize {
        self.counts.lock().get(op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }

    fn record(&self, op: &'static str) {
        *self.counts.lock().entry(op).or_default() += 1;
    }
}

/// Per-item node groups: slot -> step origin -> selected nodes.
type Groups = Vec<Vec<Vec<NodeId>>>;

#[derive(Debug, Clone)]
enum Frame {
    Values(Vec<Value>),
    Groups(Groups),
}

#[derive(Debug, Clone)]
enum Scope {
    Top,
    Predicate(Groups),
    /// Items still undecided after the left operand of a boolean, with their
    /// slots in the enclosing context and the left operand's results.
    Narrowed {
        slots: Vec<usize>,
        left: Vec<bool>,
    },
}

#[derive(Debug, Clone)]
struct ContextSet {
    items: Vec<CallContext>,
    scope: Scope,
}

/// The register file of one evaluation.
pub(crate) struct ProcessingContext<'a> {
    program: &'a Program,
    doc: &'a Document,
    counter: &'a WorkCounter,
    variables: Option<&'a dyn VariableResolver>,
    functions: Option<&'a dyn FunctionResolver>,
    stats: Option<&'a ExecStats>,
    frames: BranchStack<Frame>,
    contexts: BranchStack<ContextSet>,
    matches: Vec<FilterId>,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(program: &'a Program, doc: &'a Document, counter: &'a WorkCounter) -> Self {
        Self {
            program,
            doc,
            counter,
            variables: None,
            functions: None,
            stats: None,
            frames: BranchStack::new(),
            contexts: BranchStack::new(),
            matches: Vec::new(),
        }
    }

    pub fn with_resolvers(
        mut self,
        variables: Option<&'a dyn VariableResolver>,
        functions: Option<&'a dyn FunctionResolver>,
    ) -> Self {
        self.variables = variables;
        self.functions = functions;
        self
    }

    pub fn with_stats(mut self, stats: Option<&'a ExecStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Run the program with `node` as the context node. Returns the value left
    /// on the stack, if any.
    pub fn run(&mut self, node: NodeId) -> Result<Option<Value>, FilterError> {
        self.frames.clear();
        self.contexts.clear();
        self.matches.clear();
        self.contexts.push(ContextSet {
            items: vec![CallContext::single(node)],
            scope: Scope::Top,
        });
        self.eval(self.program.head())?;
        match self.frames.pop() {
            None => Ok(None),
            Some(Frame::Values(mut values)) if values.len() == 1 => Ok(values.pop()),
            Some(_) => Err(invalid("evaluation ended with a malformed result")),
        }
    }

    /// Filters whose `MatchFilter` fired, in execution order.
    pub fn matches(&self) -> &[FilterId] {
        &self.matches
    }

    /// Follow `next` links from `start` until the chain ends.
    pub fn eval(&mut self, start: Option<OpcodeId>) -> Result<(), FilterError> {
        let mut cursor = start;
        while let Some(id) = cursor {
            cursor = self.step(id)?;
        }
        Ok(())
    }

    fn step(&mut self, id: OpcodeId) -> Result<Option<OpcodeId>, FilterError> {
        let program = self.program;
        let doc = self.doc;
        let counter = self.counter;
        let op = program.op(id);
        if let Some(stats) = self.stats {
            stats.record(op.name());
        }
        tracing::trace!(%id, %op, "exec");

        match op {
            Opcode::PushContextNode => {
                let values = self
                    .context()?
                    .items
                    .iter()
                    .map(|item| Value::NodeSet(vec![item.node]))
                    .collect();
                self.push(values);
            }
            Opcode::SelectRoot => {
                let width = self.width()?;
                self.push(vec![Value::NodeSet(vec![doc.root()]); width]);
            }
            Opcode::Select {
                axis,
                test,
                ordinal,
                grouped,
            } => self.select(*axis, test, *ordinal, *grouped)?,
            Opcode::Union => {
                let (left, right) = self.pop_pair()?;
                let mut out = Vec::with_capacity(left.len());
                for (l, r) in left.into_iter().zip(&right) {
                    out.push(Value::NodeSet(union_nodes(l.into_node_set()?, r.as_node_set()?)));
                }
                self.push(out);
            }
            Opcode::BeginPredicate => self.begin_predicate()?,
            Opcode::EndPredicate { merge } => self.end_predicate(*merge)?,
            Opcode::PositionEquals(n) => {
                let values = self
                    .context()?
                    .items
                    .iter()
                    .map(|item| Value::Boolean(item.position == *n))
                    .collect();
                self.push(values);
            }
            Opcode::PushBool(b) => self.push_constant(Value::Boolean(*b))?,
            Opcode::PushNumber(n) => self.push_constant(Value::Number(*n))?,
            Opcode::PushString(s) => self.push_constant(Value::String(s.clone()))?,
            Opcode::Relational(rel) => {
                let (left, right) = self.pop_pair()?;
                let mut out = Vec::with_capacity(left.len());
                for (l, r) in left.iter().zip(&right) {
                    out.push(Value::Boolean(compare(*rel, l, r, doc, counter)?));
                }
                self.push(out);
            }
            Opcode::Math(math) => {
                let (left, right) = self.pop_pair()?;
                let mut out = Vec::with_capacity(left.len());
                for (l, r) in left.iter().zip(&right) {
                    let value = math.apply(l.to_number(doc, counter)?, r.to_number(doc, counter)?);
                    out.push(Value::Number(value));
                }
                self.push(out);
            }
            Opcode::Negate => {
                let values = self.pop_values()?;
                let mut out = Vec::with_capacity(values.len());
                for v in &values {
                    out.push(Value::Number(-v.to_number(doc, counter)?));
                }
                self.push(out);
            }
            Opcode::NumberEquals(n) => self.equals_literal(&Value::Number(*n))?,
            Opcode::StringEquals(s) => self.equals_literal(&Value::String(s.clone()))?,
            Opcode::StartsWithLiteral(prefix) => {
                let values = self.pop_values()?;
                let mut out = Vec::with_capacity(values.len());
                for v in &values {
                    out.push(Value::Boolean(v.to_text(doc, counter)?.starts_with(prefix.as_str())));
                }
                self.push(out);
            }
            Opcode::Function { function, argc } => {
                let args = self.pop_args(*argc)?;
                let ctx = self.context()?;
                let mut out = Vec::with_capacity(ctx.items.len());
                for (slot, item) in ctx.items.iter().enumerate() {
                    let slot_args = slot_args(&args, slot)?;
                    out.push(functions::call(*function, &slot_args, item, doc, counter)?);
                }
                self.push(out);
            }
            Opcode::Variable(name) => {
                let value = resolve_variable(self.variables, name)?;
                let width = self.width()?;
                self.push(vec![value; width]);
            }
            Opcode::ExternalFunction { name, argc } => {
                let args = self.pop_args(*argc)?;
                let width = self.width()?;
                let mut out = Vec::with_capacity(width);
                for slot in 0..width {
                    out.push(call_external(self.functions, name, &slot_args(&args, slot)?)?);
                }
                self.push(out);
            }
            Opcode::JumpIfTrue { target } | Opcode::JumpIfFalse { target } => {
                let jump_on = matches!(op, Opcode::JumpIfTrue { .. });
                let mut values = self.pop_values()?;
                let value = match (values.pop(), values.is_empty()) {
                    (Some(value), true) => value,
                    _ => return Err(invalid("short-circuit jump over more than one item")),
                };
                if value.to_boolean() == jump_on {
                    self.push(vec![Value::Boolean(jump_on)]);
                    return Ok(Some(*target));
                }
            }
            Opcode::StartBoolean { op, end } => {
                if self.start_boolean(*op)? {
                    return Ok(Some(*end));
                }
            }
            Opcode::ApplyBoolean => self.apply_boolean()?,
            Opcode::EndBoolean | Opcode::BlockEnd => {}
            Opcode::Branch(alternatives) => {
                let runs = alternatives.iter().map(|alt| (*alt, None)).collect();
                self.run_alternatives(runs)?;
            }
            Opcode::LiteralBranch(index) => self.literal_branch(index)?,
            Opcode::MatchFilter(filter) => {
                let values = self.pop_values()?;
                if values.iter().any(Value::to_boolean) {
                    tracing::debug!(filter = filter.0, "filter matched");
                    self.matches.push(*filter);
                }
            }
        }
        Ok(program.next(id))
    }

    // ========================================================================
    // Location steps and predicates
    // ========================================================================

    fn select(
        &mut self,
        axis_kind: Axis,
        test: &NodeTest,
        ordinal: Option<usize>,
        grouped: bool,
    ) -> Result<(), FilterError> {
        let input = self.pop_values()?;
        let mut groups: Groups = Vec::with_capacity(input.len());
        for value in &input {
            let mut slot = Vec::new();
            for node in value.as_node_set()? {
                let mut selected = Vec::new();
                axis::select(self.doc, *node, axis_kind, test, self.counter, &mut selected)?;
                if let Some(n) = ordinal {
                    selected = n
                        .checked_sub(1)
                        .and_then(|i| selected.get(i).copied())
                        .into_iter()
                        .collect();
                }
                slot.push(selected);
            }
            groups.push(slot);
        }
        if grouped {
            self.frames.push(Frame::Groups(groups));
        } else {
            self.push(groups.into_iter().map(merge_groups).collect());
        }
        Ok(())
    }

    fn begin_predicate(&mut self) -> Result<(), FilterError> {
        let groups: Groups = match self.frames.pop() {
            Some(Frame::Groups(groups)) => groups,
            Some(Frame::Values(values)) => values
                .into_iter()
                .map(|v| Ok(vec![v.into_node_set()?]))
                .collect::<Result<_, FilterError>>()?,
            None => return Err(invalid("predicate without a node sequence")),
        };
        let mut items = Vec::new();
        for slot in &groups {
            for group in slot {
                let size = group.len();
                items.extend(group.iter().enumerate().map(|(i, node)| CallContext {
                    node: *node,
                    position: i + 1,
                    size,
                }));
            }
        }
        self.contexts.push(ContextSet {
            items,
            scope: Scope::Predicate(groups),
        });
        Ok(())
    }

    fn end_predicate(&mut self, merge: bool) -> Result<(), FilterError> {
        let verdicts = self.pop_values()?;
        let Some(ContextSet {
            items,
            scope: Scope::Predicate(groups),
        }) = self.contexts.pop()
        else {
            return Err(invalid("predicate end without a predicate scope"));
        };
        if items.len() != verdicts.len() {
            return Err(invalid("predicate produced the wrong number of results"));
        }

        let mut keep = items
            .iter()
            .zip(&verdicts)
            .map(|(item, verdict)| predicate_holds(verdict, item.position));
        let mut filtered: Groups = Vec::with_capacity(groups.len());
        for slot in groups {
            let mut kept_slot = Vec::with_capacity(slot.len());
            for group in slot {
                let mut kept = Vec::new();
                for node in group {
                    if keep.next().unwrap_or(false) {
                        kept.push(node);
                    }
                }
                kept_slot.push(kept);
            }
            filtered.push(kept_slot);
        }

        if merge {
            self.push(filtered.into_iter().map(merge_groups).collect());
        } else {
            self.frames.push(Frame::Groups(filtered));
        }
        Ok(())
    }

    // ========================================================================
    // Booleans over context items
    // ========================================================================

    /// Returns true when every item was decided by the left operand.
    fn start_boolean(&mut self, op: BooleanOp) -> Result<bool, FilterError> {
        let left: Vec<bool> = self.pop_values()?.iter().map(Value::to_boolean).collect();
        let slots: Vec<usize> = left
            .iter()
            .enumerate()
            .filter(|(_, truth)| op.undecided(**truth))
            .map(|(slot, _)| slot)
            .collect();
        if slots.is_empty() {
            self.push(left.into_iter().map(Value::Boolean).collect());
            return Ok(true);
        }

        let current = self.context()?;
        let items = slots
            .iter()
            .map(|slot| current.items.get(*slot).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("boolean operand wider than its context"))?;
        self.contexts.push(ContextSet {
            items,
            scope: Scope::Narrowed { slots, left },
        });
        Ok(false)
    }

    fn apply_boolean(&mut self) -> Result<(), FilterError> {
        let right = self.pop_values()?;
        let Some(ContextSet {
            scope: Scope::Narrowed { slots, mut left },
            ..
        }) = self.contexts.pop()
        else {
            return Err(invalid("boolean apply without a boolean scope"));
        };
        if slots.len() != right.len() {
            return Err(invalid("boolean operand produced the wrong number of results"));
        }
        for (slot, value) in slots.iter().zip(&right) {
            if let Some(truth) = left.get_mut(*slot) {
                *truth = value.to_boolean();
            }
        }
        self.push(left.into_iter().map(Value::Boolean).collect());
        Ok(())
    }

    // ========================================================================
    // Branches
    // ========================================================================

    fn literal_branch(&mut self, index: &BranchIndex) -> Result<(), FilterError> {
        let input = self.pop_values()?;
        let width = input.len();
        let mut hits = Vec::new();
        for (slot, value) in input.iter().enumerate() {
            index.lookup(value, self.doc, self.counter, &mut |branch| {
                hits.push((branch, slot))
            })?;
        }
        hits.sort_unstable();
        hits.dedup();

        let mut runs = Vec::new();
        for branch in index.always() {
            if !hits.iter().any(|(hit, _)| *hit == branch) {
                if let Some(target) = index.target(branch) {
                    runs.push((target, Some(vec![false; width])));
                }
            }
        }
        for group in hits.chunk_by(|a, b| a.0 == b.0) {
            let mut mask = vec![false; width];
            for (_, slot) in group {
                if let Some(bit) = mask.get_mut(*slot) {
                    *bit = true;
                }
            }
            if let Some(target) = index.target(group[0].0) {
                runs.push((target, Some(mask)));
            }
        }
        tracing::debug!(
            literals = index.len(),
            hits = hits.len(),
            runs = runs.len(),
            "literal branch"
        );
        self.run_alternatives(runs)
    }

    /// Run each alternative from the same stack state. When a mask is given
    /// it is pushed as the alternative's input.
    fn run_alternatives(
        &mut self,
        runs: Vec<(OpcodeId, Option<Vec<bool>>)>,
    ) -> Result<(), FilterError> {
        let count = runs.len();
        if count == 0 {
            return Ok(());
        }
        self.checkpoint();
        for (i, (target, mask)) in runs.into_iter().enumerate() {
            let last = i + 1 == count;
            if last {
                self.release();
            }
            if let Some(mask) = mask {
                self.push(mask.into_iter().map(Value::Boolean).collect());
            }
            let result = self.eval(Some(target));
            if !last {
                self.rewind();
            }
            result?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) {
        self.frames.checkpoint();
        self.contexts.checkpoint();
    }

    fn rewind(&mut self) {
        self.frames.rewind();
        self.contexts.rewind();
    }

    fn release(&mut self) {
        self.frames.release();
        self.contexts.release();
    }

    // ========================================================================
    // Stack helpers
    // ========================================================================

    fn context(&self) -> Result<&ContextSet, FilterError> {
        self.contexts
            .last()
            .ok_or_else(|| invalid("no context items"))
    }

    fn width(&self) -> Result<usize, FilterError> {
        Ok(self.context()?.items.len())
    }

    fn push(&mut self, values: Vec<Value>) {
        self.frames.push(Frame::Values(values));
    }

    fn push_constant(&mut self, value: Value) -> Result<(), FilterError> {
        let width = self.width()?;
        self.push(vec![value; width]);
        Ok(())
    }

    fn pop_values(&mut self) -> Result<Vec<Value>, FilterError> {
        match self.frames.pop() {
            Some(Frame::Values(values)) => Ok(values),
            Some(Frame::Groups(_)) => Err(invalid("expected values, found grouped nodes")),
            None => Err(invalid("value stack underflow")),
        }
    }

    fn pop_pair(&mut self) -> Result<(Vec<Value>, Vec<Value>), FilterError> {
        let right = self.pop_values()?;
        let left = self.pop_values()?;
        if left.len() != right.len() {
            return Err(invalid("operands of different widths"));
        }
        Ok((left, right))
    }

    fn pop_args(&mut self, argc: usize) -> Result<Vec<Vec<Value>>, FilterError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop_values()?);
        }
        args.reverse();
        Ok(args)
    }

    fn equals_literal(&mut self, literal: &Value) -> Result<(), FilterError> {
        let values = self.pop_values()?;
        let mut out = Vec::with_capacity(values.len());
        for v in &values {
            out.push(Value::Boolean(compare(
                RelOp::Eq,
                v,
                literal,
                self.doc,
                self.counter,
            )?));
        }
        self.push(out);
        Ok(())
    }
}

fn slot_args(args: &[Vec<Value>], slot: usize) -> Result<Vec<Value>, FilterError> {
    args.iter()
        .map(|frame| frame.get(slot).cloned())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| invalid("function argument narrower than its context"))
}

fn merge_groups(groups: Vec<Vec<NodeId>>) -> Value {
    let mut nodes: Vec<NodeId> = groups.into_iter().flatten().collect();
    nodes.sort_unstable();
    nodes.dedup();
    Value::NodeSet(nodes)
}

fn invalid(message: &str) -> FilterError {
    FilterError::InvalidProgram(message.to_owned())
}
