//! Literal-keyed branch index.
//!
//! When several merged filters test the same value against different
//! literals (`a = 'x'`, `a = 'y'`, ...), the value is looked up once and only
//! the alternatives whose literal matched are run. Some alternatives must run
//! even when their literal did not match; those are flagged "always".

use std::collections::HashMap;

use switchyard_core::Document;

use crate::ast::RelOp;
use crate::opcode::{Opcode, OpcodeId, Program};
use crate::value::{compare_atoms, node_text, parse_number};
use crate::{FilterError, Value, WorkCounter};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(f64),
}

impl Literal {
    fn as_value(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => Value::Number(*n),
        }
    }

    /// The literal tested by an equality opcode, if it is one.
    pub fn from_opcode(op: &Opcode) -> Option<Self> {
        match op {
            Opcode::StringEquals(s) => Some(Self::String(s.clone())),
            Opcode::NumberEquals(n) => Some(Self::Number(*n)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(u32);

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    literal: Literal,
    target: OpcodeId,
    always: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchIndex {
    entries: Vec<Entry>,
    strings: HashMap<String, Vec<BranchId>>,
    numbers: HashMap<u64, Vec<BranchId>>,
}

impl BranchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register the alternative starting at `target` for `literal`.
    pub fn insert(&mut self, literal: Literal, target: OpcodeId) -> BranchId {
        let id = BranchId(self.entries.len() as u32);
        let ids = match &literal {
            Literal::String(s) => self.strings.entry(s.clone()).or_default(),
            Literal::Number(n) => self.numbers.entry(number_key(*n)).or_default(),
        };
        if let Err(at) = ids.binary_search(&id) {
            ids.insert(at, id);
        }
        self.entries.push(Entry {
            literal,
            target,
            always: false,
        });
        id
    }

    pub fn set_always(&mut self, id: BranchId, always: bool) {
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            entry.always = always;
        }
    }

    pub fn is_always(&self, id: BranchId) -> bool {
        self.entries.get(id.0 as usize).is_some_and(|e| e.always)
    }

    pub fn ids(&self) -> impl Iterator<Item = BranchId> {
        (0..self.entries.len() as u32).map(BranchId)
    }

    pub fn always(&self) -> impl Iterator<Item = BranchId> + '_ {
        self.ids().filter(|id| self.is_always(*id))
    }

    pub fn target(&self, id: BranchId) -> Option<OpcodeId> {
        self.entries.get(id.0 as usize).map(|e| e.target)
    }

    pub fn literal(&self, id: BranchId) -> Option<&Literal> {
        self.entries.get(id.0 as usize).map(|e| &e.literal)
    }

    pub(crate) fn entries(&self) -> Vec<OpcodeId> {
        self.entries.iter().map(|e| e.target).collect()
    }

    pub(crate) fn map_entries(&mut self, mut f: impl FnMut(OpcodeId) -> OpcodeId) {
        for entry in &mut self.entries {
            entry.target = f(entry.target);
        }
    }

    /// Report every branch whose literal equals `value` under the `=` rules.
    pub(crate) fn lookup(
        &self,
        value: &Value,
        doc: &Document,
        counter: &WorkCounter,
        hits: &mut impl FnMut(BranchId),
    ) -> Result<(), FilterError> {
        match value {
            Value::NodeSet(nodes) => {
                for node in nodes {
                    let text = node_text(doc, *node, counter)?;
                    self.lookup_text(&text, counter, hits)?;
                }
            }
            Value::String(text) => self.lookup_text(text, counter, hits)?,
            atom => {
                for (i, entry) in self.entries.iter().enumerate() {
                    counter.increase()?;
                    if compare_atoms(RelOp::Eq, atom, &entry.literal.as_value()) {
                        hits(BranchId(i as u32));
                    }
                }
            }
        }
        Ok(())
    }

    fn lookup_text(
        &self,
        text: &str,
        counter: &WorkCounter,
        hits: &mut impl FnMut(BranchId),
    ) -> Result<(), FilterError> {
        counter.increase()?;
        if let Some(ids) = self.strings.get(text) {
            ids.iter().copied().for_each(&mut *hits);
        }
        let n = parse_number(text);
        if !n.is_nan() {
            if let Some(ids) = self.numbers.get(&number_key(n)) {
                ids.iter().copied().for_each(&mut *hits);
            }
        }
        Ok(())
    }
}

/// Hash key for a number literal; `-0` and `0` share a key.
fn number_key(n: f64) -> u64 {
    if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

/// Whether the alternative starting at `head` must run even when its
/// literal did not match.
///
/// A non-matching alternative starts from an all-false result. It can be
/// skipped only if the opcodes that follow turn a false input into no
/// observable effect: a `MatchFilter` sink, block ends, and `JumpIfFalse`
/// whose target is itself followed by such opcodes. Anything else (a
/// `JumpIfTrue` that would fall through to another operand, a function, a
/// comparison, a nested branch) may act on the false input and has to run.
pub fn branch_needs_always(program: &Program, head: OpcodeId) -> bool {
    let mut cursor = Some(head);
    while let Some(id) = cursor {
        cursor = match program.op(id) {
            Opcode::MatchFilter(_) => return false,
            Opcode::BlockEnd => program.next(id),
            Opcode::JumpIfFalse { target } => program.next(*target),
            _ => return true,
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::FilterId;
    use switchyard_core::DocumentBuilder;

    fn chain(ops: Vec<Opcode>) -> (Program, OpcodeId) {
        let mut program = Program::new();
        let mut head = None;
        for op in ops {
            let id = program.append(op);
            head.get_or_insert(id);
        }
        (program, head.unwrap())
    }

    #[test]
    fn a_direct_sink_is_pure() {
        let (program, head) = chain(vec![Opcode::MatchFilter(FilterId(0))]);
        assert!(!branch_needs_always(&program, head));
    }

    #[test]
    fn block_ends_are_skipped() {
        let (program, head) = chain(vec![Opcode::BlockEnd, Opcode::MatchFilter(FilterId(0))]);
        assert!(!branch_needs_always(&program, head));
    }

    #[test]
    fn jump_if_false_is_pure_when_its_target_leads_to_a_sink() {
        let mut program = Program::new();
        let end = program.allocate(Opcode::BlockEnd);
        let head = program.append(Opcode::JumpIfFalse { target: end });
        program.append(Opcode::PushContextNode);
        program.append(Opcode::Function {
            function: crate::ast::Function::Boolean,
            argc: 1,
        });
        program.link(end);
        program.append(Opcode::MatchFilter(FilterId(0)));
        assert!(!branch_needs_always(&program, head));
    }

    #[test]
    fn jump_if_false_into_another_operand_is_not_pure() {
        let mut program = Program::new();
        let end = program.allocate(Opcode::BlockEnd);
        let outer = program.allocate(Opcode::BlockEnd);
        let head = program.append(Opcode::JumpIfFalse { target: end });
        program.append(Opcode::PushBool(true));
        program.link(end);
        program.append(Opcode::JumpIfTrue { target: outer });
        program.append(Opcode::PushBool(true));
        program.link(outer);
        program.append(Opcode::MatchFilter(FilterId(0)));
        assert!(branch_needs_always(&program, head));
    }

    #[test]
    fn jump_if_true_is_not_pure() {
        let mut program = Program::new();
        let end = program.allocate(Opcode::BlockEnd);
        let head = program.append(Opcode::JumpIfTrue { target: end });
        program.link(end);
        program.append(Opcode::MatchFilter(FilterId(0)));
        assert!(branch_needs_always(&program, head));
    }

    #[test]
    fn functions_and_predicates_are_not_pure() {
        let (program, head) = chain(vec![
            Opcode::Function {
                function: crate::ast::Function::Not,
                argc: 1,
            },
            Opcode::MatchFilter(FilterId(0)),
        ]);
        assert!(branch_needs_always(&program, head));

        let (program, head) = chain(vec![
            Opcode::EndPredicate { merge: true },
            Opcode::MatchFilter(FilterId(0)),
        ]);
        assert!(branch_needs_always(&program, head));
    }

    #[test]
    fn lookup_matches_strings_and_numbers_from_node_text() {
        let doc = DocumentBuilder::new().leaf("a", "02").finish();
        let a = doc.document_element().unwrap();
        let mut index = BranchIndex::new();
        let two = index.insert(Literal::Number(2.0), OpcodeId(10));
        let text = index.insert(Literal::String("02".into()), OpcodeId(11));
        index.insert(Literal::String("2".into()), OpcodeId(12));

        let counter = WorkCounter::unbounded();
        let mut hits = Vec::new();
        index
            .lookup(&Value::NodeSet(vec![a]), &doc, &counter, &mut |id| hits.push(id))
            .unwrap();
        hits.sort();
        assert_eq!(hits, vec![two, text]);
    }

    #[test]
    fn booleans_compare_against_every_literal() {
        let doc = Document::empty();
        let mut index = BranchIndex::new();
        index.insert(Literal::String(String::new()), OpcodeId(0));
        let nonempty = index.insert(Literal::String("x".into()), OpcodeId(1));
        let counter = WorkCounter::unbounded();
        let mut hits = Vec::new();
        index
            .lookup(&Value::Boolean(true), &doc, &counter, &mut |id| hits.push(id))
            .unwrap();
        assert_eq!(hits, vec![nonempty]);
    }
}
