//! The opcode arena.
//!
//! A compiled query is a graph of opcodes stored in a flat arena and linked by
//! index. Straight-line code follows `next`; jumps, branch alternatives and
//! literal-branch entries are jump edges recorded on both ends so a node can
//! be removed without leaving a dangling edge behind:
//!
//! ```text
//!   #0 PushContextNode
//!   #1 Select child::a
//!   #2 NumberEquals 1 ──┐ JumpIfTrue
//!   #3 JumpIfTrue ──────┼──────────┐
//!   #4 ...              │          │
//!   #5 BlockEnd  <──────┘ sources: [#3]
//! ```

use core::fmt;
use std::mem;

use crate::ast::{Axis, Function, MathOp, NodeTest, RelOp};
use crate::branch::BranchIndex;
use crate::FilterError;

/// Index of an opcode within its [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpcodeId(pub(crate) u32);

impl OpcodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpcodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a filter inside a [`FilterTable`](crate::FilterTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOp {
    And,
    Or,
}

impl BooleanOp {
    /// Whether an item whose left operand evaluated to `left` still needs
    /// the right operand.
    pub fn undecided(self, left: bool) -> bool {
        match self {
            Self::And => left,
            Self::Or => !left,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// Push the context node of every context item.
    PushContextNode,
    SelectRoot,
    /// Walk one location step from every node on top of the stack. With an
    /// ordinal only the n-th node of each step result is kept; grouped
    /// selections keep per-node results apart for a following predicate.
    Select {
        axis: Axis,
        test: NodeTest,
        ordinal: Option<usize>,
        grouped: bool,
    },
    Union,
    /// Open a predicate scope: every selected node becomes a context item.
    BeginPredicate,
    /// Close a predicate scope, keeping the nodes whose predicate held.
    EndPredicate {
        merge: bool,
    },
    /// `position() = n` inside a predicate scope.
    PositionEquals(usize),
    PushBool(bool),
    PushNumber(f64),
    PushString(String),
    Relational(RelOp),
    Math(MathOp),
    Negate,
    NumberEquals(f64),
    StringEquals(String),
    StartsWithLiteral(String),
    Function {
        function: Function,
        argc: usize,
    },
    Variable(String),
    ExternalFunction {
        name: String,
        argc: usize,
    },
    /// Short-circuit on a single boolean: when taken, the tested value is
    /// left on the stack and execution continues at `target`.
    JumpIfTrue {
        target: OpcodeId,
    },
    JumpIfFalse {
        target: OpcodeId,
    },
    /// Begin a boolean over a set of context items. Items decided by the left
    /// operand skip the right operand; when all are decided execution
    /// continues at `end`.
    StartBoolean {
        op: BooleanOp,
        end: OpcodeId,
    },
    ApplyBoolean,
    EndBoolean,
    BlockEnd,
    /// Run every alternative against the same stack state.
    Branch(Vec<OpcodeId>),
    /// Pick alternatives by looking the top value up in a literal index.
    LiteralBranch(Box<BranchIndex>),
    MatchFilter(FilterId),
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PushContextNode => "PushContextNode",
            Self::SelectRoot => "SelectRoot",
            Self::Select { .. } => "Select",
            Self::Union => "Union",
            Self::BeginPredicate => "BeginPredicate",
            Self::EndPredicate { .. } => "EndPredicate",
            Self::PositionEquals(_) => "PositionEquals",
            Self::PushBool(_) => "PushBool",
            Self::PushNumber(_) => "PushNumber",
            Self::PushString(_) => "PushString",
            Self::Relational(_) => "Relational",
            Self::Math(_) => "Math",
            Self::Negate => "Negate",
            Self::NumberEquals(_) => "NumberEquals",
            Self::StringEquals(_) => "StringEquals",
            Self::StartsWithLiteral(_) => "StartsWithLiteral",
            Self::Function { .. } => "Function",
            Self::Variable(_) => "Variable",
            Self::ExternalFunction { .. } => "ExternalFunction",
            Self::JumpIfTrue { .. } => "JumpIfTrue",
            Self::JumpIfFalse { .. } => "JumpIfFalse",
            Self::StartBoolean { .. } => "StartBoolean",
            Self::ApplyBoolean => "ApplyBoolean",
            Self::EndBoolean => "EndBoolean",
            Self::BlockEnd => "BlockEnd",
            Self::Branch(_) => "Branch",
            Self::LiteralBranch(_) => "LiteralBranch",
            Self::MatchFilter(_) => "MatchFilter",
        }
    }

    pub fn jump_targets(&self) -> Vec<OpcodeId> {
        match self {
            Self::JumpIfTrue { target } | Self::JumpIfFalse { target } => vec![*target],
            Self::StartBoolean { end, .. } => vec![*end],
            Self::Branch(alternatives) => alternatives.clone(),
            Self::LiteralBranch(index) => index.entries(),
            _ => Vec::new(),
        }
    }

    pub fn is_jump_source(&self) -> bool {
        matches!(
            self,
            Self::JumpIfTrue { .. }
                | Self::JumpIfFalse { .. }
                | Self::StartBoolean { .. }
                | Self::Branch(_)
                | Self::LiteralBranch(_)
        )
    }

    pub(crate) fn map_targets(&mut self, mut f: impl FnMut(OpcodeId) -> OpcodeId) {
        match self {
            Self::JumpIfTrue { target } | Self::JumpIfFalse { target } => *target = f(*target),
            Self::StartBoolean { end, .. } => *end = f(*end),
            Self::Branch(alternatives) => {
                for alt in alternatives {
                    *alt = f(*alt);
                }
            }
            Self::LiteralBranch(index) => index.map_entries(f),
            _ => {}
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select {
                axis,
                test,
                ordinal,
                grouped,
            } => {
                write!(f, "Select {axis:?}::{test:?}")?;
                if let Some(n) = ordinal {
                    write!(f, "[{n}]")?;
                }
                if *grouped {
                    f.write_str(" grouped")?;
                }
                Ok(())
            }
            Self::NumberEquals(n) => write!(f, "NumberEquals {n}"),
            Self::StringEquals(s) => write!(f, "StringEquals {s:?}"),
            Self::StartsWithLiteral(s) => write!(f, "StartsWithLiteral {s:?}"),
            Self::Relational(op) => write!(f, "Relational {op}"),
            Self::Function { function, argc } => write!(f, "Function {}/{argc}", function.name()),
            Self::MatchFilter(id) => write!(f, "MatchFilter {}", id.0),
            other => {
                f.write_str(other.name())?;
                let targets = other.jump_targets();
                if !targets.is_empty() {
                    f.write_str(" ->")?;
                    for target in targets {
                        write!(f, " {target}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    op: Opcode,
    next: Option<OpcodeId>,
    prev: Option<OpcodeId>,
    sources: Vec<OpcodeId>,
    linked: bool,
}

/// Head and tail of the chain currently being appended to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chain {
    head: Option<OpcodeId>,
    tail: Option<OpcodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    slots: Vec<Slot>,
    chain: Chain,
    needs_context: bool,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// First opcode of the main chain.
    pub fn head(&self) -> Option<OpcodeId> {
        self.chain.head
    }

    pub fn op(&self, id: OpcodeId) -> &Opcode {
        &self.slots[id.index()].op
    }

    pub fn next(&self, id: OpcodeId) -> Option<OpcodeId> {
        self.slots[id.index()].next
    }

    pub fn prev(&self, id: OpcodeId) -> Option<OpcodeId> {
        self.slots[id.index()].prev
    }

    /// Opcodes that jump to `id`.
    pub fn jump_sources(&self, id: OpcodeId) -> &[OpcodeId] {
        &self.slots[id.index()].sources
    }

    /// Whether evaluation reads the caller's context node, as opposed to
    /// starting every path from the root.
    pub fn needs_context(&self) -> bool {
        self.needs_context
    }

    pub(crate) fn set_needs_context(&mut self, needs_context: bool) {
        self.needs_context = needs_context;
    }

    /// Number of linked opcodes across all chains.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.linked).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linked opcode ids in allocation order, across all chains.
    pub fn ids(&self) -> Vec<OpcodeId> {
        (0..self.slots.len())
            .map(|i| OpcodeId(i as u32))
            .filter(|id| self.slots[id.index()].linked)
            .collect()
    }

    /// Walk the main chain.
    pub fn iter(&self) -> impl Iterator<Item = (OpcodeId, &Opcode)> + '_ {
        let mut cursor = self.chain.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.next(id);
            Some((id, self.op(id)))
        })
    }

    /// Create an opcode without linking it, so jumps can name it before it is
    /// placed.
    pub fn allocate(&mut self, op: Opcode) -> OpcodeId {
        let id = OpcodeId(self.slots.len() as u32);
        self.slots.push(Slot {
            op,
            next: None,
            prev: None,
            sources: Vec::new(),
            linked: false,
        });
        id
    }

    pub fn append(&mut self, op: Opcode) -> OpcodeId {
        let id = self.allocate(op);
        self.link(id);
        id
    }

    /// Place an allocated opcode at the end of the current chain and record
    /// its jump edges.
    pub fn link(&mut self, id: OpcodeId) {
        let slot = &mut self.slots[id.index()];
        if slot.linked {
            return;
        }
        slot.linked = true;
        slot.prev = self.chain.tail;
        match self.chain.tail {
            Some(tail) => self.slots[tail.index()].next = Some(id),
            None => self.chain.head = Some(id),
        }
        self.chain.tail = Some(id);
        for target in self.op(id).jump_targets() {
            self.add_jump(id, target);
        }
    }

    /// Start a detached chain (a branch alternative). Pass the returned value
    /// to [`end_chain`](Self::end_chain) to resume the previous chain.
    pub fn begin_chain(&mut self) -> Chain {
        mem::take(&mut self.chain)
    }

    /// Finish the detached chain and return its head.
    pub fn end_chain(&mut self, saved: Chain) -> Option<OpcodeId> {
        mem::replace(&mut self.chain, saved).head
    }

    pub fn add_jump(&mut self, source: OpcodeId, target: OpcodeId) {
        let sources = &mut self.slots[target.index()].sources;
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    pub fn remove_jump(&mut self, source: OpcodeId, target: OpcodeId) {
        self.slots[target.index()].sources.retain(|s| *s != source);
    }

    /// Unlink an opcode. Jumps into it are first redirected to its successor;
    /// its own outgoing jumps are dropped.
    pub fn remove(&mut self, id: OpcodeId) -> Result<(), FilterError> {
        let slot = &self.slots[id.index()];
        if !slot.linked {
            return Ok(());
        }
        let next = slot.next;
        if !slot.sources.is_empty() && next.is_none() {
            return Err(FilterError::InvalidProgram(format!(
                "{id} is a jump target with no successor"
            )));
        }

        for target in self.op(id).jump_targets() {
            self.remove_jump(id, target);
        }
        let sources = mem::take(&mut self.slots[id.index()].sources);
        if let Some(to) = next {
            for source in sources {
                self.slots[source.index()]
                    .op
                    .map_targets(|t| if t == id { to } else { t });
                self.add_jump(source, to);
            }
        }

        let prev = self.slots[id.index()].prev;
        if let Some(p) = prev {
            self.slots[p.index()].next = next;
        }
        if let Some(n) = next {
            self.slots[n.index()].prev = prev;
        }
        if self.chain.head == Some(id) {
            self.chain.head = next;
        }
        if self.chain.tail == Some(id) {
            self.chain.tail = prev;
        }
        let slot = &mut self.slots[id.index()];
        slot.linked = false;
        slot.next = None;
        slot.prev = None;
        tracing::trace!(%id, op = slot.op.name(), "removed opcode");
        Ok(())
    }

    /// The main chain as owned opcodes, for re-emission into another program.
    pub(crate) fn linearize(&self) -> Vec<(OpcodeId, Opcode)> {
        self.iter().map(|(id, op)| (id, op.clone())).collect()
    }

    /// Emit `ops` (taken from another program) at the end of the current
    /// chain, remapping their jump targets to the new slots.
    pub(crate) fn splice(&mut self, ops: &[(OpcodeId, Opcode)]) {
        let mut remap = std::collections::HashMap::with_capacity(ops.len());
        for (old, op) in ops {
            remap.insert(*old, self.allocate(op.clone()));
        }
        for (old, _) in ops {
            let Some(new) = remap.get(old).copied() else {
                continue;
            };
            self.slots[new.index()]
                .op
                .map_targets(|t| remap.get(&t).copied().unwrap_or(t));
            self.link(new);
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.ids() {
            let marker = if self.prev(id).is_none() { '>' } else { ' ' };
            writeln!(f, "{marker}{id:>5}  {}", self.op(id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_a_jump_target_redirects_its_sources() {
        let mut program = Program::new();
        let end = program.allocate(Opcode::BlockEnd);
        program.append(Opcode::PushBool(true));
        let jump = program.append(Opcode::JumpIfTrue { target: end });
        program.append(Opcode::PushBool(false));
        program.link(end);
        let after = program.append(Opcode::MatchFilter(FilterId(0)));

        assert_eq!(program.jump_sources(end), &[jump]);
        program.remove(end).unwrap();
        assert_eq!(program.op(jump), &Opcode::JumpIfTrue { target: after });
        assert_eq!(program.jump_sources(after), &[jump]);
        assert_eq!(program.len(), 4);
    }

    #[test]
    fn removing_a_jump_source_unregisters_it() {
        let mut program = Program::new();
        let end = program.allocate(Opcode::BlockEnd);
        let first = program.append(Opcode::PushBool(false));
        let jump = program.append(Opcode::JumpIfFalse { target: end });
        program.link(end);

        program.remove(jump).unwrap();
        assert!(program.jump_sources(end).is_empty());
        assert_eq!(program.next(first), Some(end));
        assert_eq!(program.prev(end), Some(first));
    }

    #[test]
    fn a_trailing_jump_target_cannot_be_removed() {
        let mut program = Program::new();
        let end = program.allocate(Opcode::BlockEnd);
        program.append(Opcode::JumpIfTrue { target: end });
        program.link(end);
        assert!(matches!(
            program.remove(end),
            Err(FilterError::InvalidProgram(_))
        ));
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn detached_chains_keep_the_main_chain_intact() {
        let mut program = Program::new();
        program.append(Opcode::PushContextNode);
        let saved = program.begin_chain();
        program.append(Opcode::MatchFilter(FilterId(1)));
        let alt = program.end_chain(saved).unwrap();
        program.append(Opcode::Branch(vec![alt]));

        let main: Vec<_> = program.iter().map(|(_, op)| op.name()).collect();
        assert_eq!(main, ["PushContextNode", "Branch"]);
        assert_eq!(program.prev(alt), None);
        assert_eq!(program.jump_sources(alt).len(), 1);
    }
}
