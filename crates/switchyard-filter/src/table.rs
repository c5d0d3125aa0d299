//! Many filters evaluated as one program.
//!
//! Every filter is compiled in inverse mode and split into a jump-free
//! prefix and a tail. Prefixes are merged into a trie, so filters that start
//! with the same opcodes evaluate them once:
//!
//! ```text
//!   order/a = 1        PushContextNode
//!   order/a = 2          Select order
//!   order/b                Branch
//!                            ├─ Select a
//!                            │    LiteralBranch { 1 -> MatchFilter 0, 2 -> MatchFilter 1 }
//!                            └─ Select b
//!                                 Function boolean/1
//!                                 MatchFilter 2
//! ```
//!
//! Where two or more continuations start with a literal equality test, the
//! tested value is looked up in a [`BranchIndex`] instead of being compared
//! against each literal in turn.

use std::collections::HashSet;

use switchyard_core::{Document, DEFAULT_FILTER_NODE_QUOTA};

use crate::branch::{branch_needs_always, BranchIndex, Literal};
use crate::compiler::{CompileMode, Compiler};
use crate::opcode::{FilterId, Opcode, OpcodeId, Program};
use crate::vm::{ExecStats, ProcessingContext};
use crate::{optimizer, parse, FilterError, WorkCounter};

struct Entry<V> {
    id: FilterId,
    source: String,
    program: Program,
    value: V,
}

/// A set of filters, each carrying a value, evaluated together.
pub struct FilterTable<V> {
    entries: Vec<Entry<V>>,
    next_id: u32,
    quota: usize,
    merged: Program,
}

impl<V> Default for FilterTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FilterTable<V> {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_FILTER_NODE_QUOTA)
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            quota,
            merged: Program::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The merged program.
    pub fn program(&self) -> &Program {
        &self.merged
    }

    pub fn source(&self, id: FilterId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.source.as_str())
    }

    pub fn get(&self, id: FilterId) -> Option<&V> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.value)
    }

    /// Compile `source` and add it with `value`.
    pub fn add(&mut self, source: &str, value: V) -> Result<FilterId, FilterError> {
        let id = FilterId(self.next_id);
        let expr = parse(source)?;
        let mut program = Compiler::new(CompileMode::Inverse).compile_filter(&expr, id)?;
        optimizer::optimize(&mut program)?;

        self.entries.push(Entry {
            id,
            source: source.to_owned(),
            program,
            value,
        });
        if let Err(e) = self.rebuild() {
            self.entries.pop();
            return Err(e);
        }
        self.next_id += 1;
        tracing::debug!(filter = id.0, source, filters = self.entries.len(), "added filter");
        Ok(id)
    }

    /// Remove a filter, returning its value.
    pub fn remove(&mut self, id: FilterId) -> Result<Option<V>, FilterError> {
        let Some(at) = self.entries.iter().position(|e| e.id == id) else {
            return Ok(None);
        };
        let entry = self.entries.remove(at);
        self.rebuild()?;
        tracing::debug!(filter = id.0, filters = self.entries.len(), "removed filter");
        Ok(Some(entry.value))
    }

    /// Values of every filter matching `doc`, in insertion order.
    pub fn matching(&self, doc: &Document) -> Result<Vec<&V>, FilterError> {
        let ids = self.matching_ids(doc, None)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| ids.contains(&e.id))
            .map(|e| &e.value)
            .collect())
    }

    /// The value of the single filter matching `doc`, if any. More than one
    /// match is an error.
    pub fn get_match(&self, doc: &Document) -> Result<Option<&V>, FilterError> {
        let mut matched = self.matching(doc)?.into_iter();
        match (matched.next(), matched.next()) {
            (first, None) => Ok(first),
            (Some(_), Some(_)) => {
                tracing::warn!(filters = self.entries.len(), "more than one filter matched");
                Err(FilterError::MultipleMatches)
            }
            (None, Some(_)) => Err(FilterError::MultipleMatches),
        }
    }

    /// Ids of the matching filters, recording executed opcodes in `stats`.
    pub fn matching_ids(
        &self,
        doc: &Document,
        stats: Option<&ExecStats>,
    ) -> Result<HashSet<FilterId>, FilterError> {
        if self.entries.is_empty() {
            return Ok(HashSet::new());
        }
        let counter = WorkCounter::new(self.quota);
        let mut context = ProcessingContext::new(&self.merged, doc, &counter).with_stats(stats);
        context.run(doc.root())?;
        Ok(context.matches().iter().copied().collect())
    }

    fn rebuild(&mut self) -> Result<(), FilterError> {
        let mut trie = Trie::default();
        for entry in &self.entries {
            let ops = entry.program.linearize();
            let split = ops
                .iter()
                .position(|(id, op)| !shareable(&entry.program, *id, op))
                .unwrap_or(ops.len());
            let (prefix, tail) = ops.split_at(split);
            trie.insert(prefix.iter().map(|(_, op)| op), tail.to_vec());
        }

        let mut merged = Program::new();
        trie.emit(&mut merged)?;
        tracing::debug!(
            filters = self.entries.len(),
            opcodes = merged.len(),
            "rebuilt filter table"
        );
        self.merged = merged;
        Ok(())
    }
}

/// Whether an opcode can be merged with equal opcodes of other filters.
fn shareable(program: &Program, id: OpcodeId, op: &Opcode) -> bool {
    !op.is_jump_source()
        && program.jump_sources(id).is_empty()
        && !matches!(
            op,
            Opcode::BlockEnd | Opcode::EndBoolean | Opcode::MatchFilter(_)
        )
}

#[derive(Default)]
struct Trie {
    children: Vec<TrieNode>,
    tails: Vec<Vec<(OpcodeId, Opcode)>>,
}

struct TrieNode {
    op: Opcode,
    next: Trie,
}

impl Trie {
    fn insert<'a>(&mut self, prefix: impl IntoIterator<Item = &'a Opcode>, tail: Vec<(OpcodeId, Opcode)>) {
        let mut node = self;
        for op in prefix {
            let at = match node.children.iter().position(|c| c.op == *op) {
                Some(at) => at,
                None => {
                    node.children.push(TrieNode {
                        op: op.clone(),
                        next: Trie::default(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[at].next;
        }
        node.tails.push(tail);
    }

    /// Append this subtree to the current chain of `program`.
    fn emit(&self, program: &mut Program) -> Result<(), FilterError> {
        let mut node = self;
        while node.children.len() == 1 && node.tails.is_empty() {
            let child = &node.children[0];
            program.append(child.op.clone());
            node = &child.next;
        }
        if node.children.is_empty() {
            match node.tails.as_slice() {
                [] => return Ok(()),
                [tail] => {
                    program.splice(tail);
                    return Ok(());
                }
                _ => {}
            }
        }
        node.emit_alternatives(program)
    }

    fn emit_alternatives(&self, program: &mut Program) -> Result<(), FilterError> {
        let (literals, others): (Vec<_>, Vec<_>) = self
            .children
            .iter()
            .partition(|c| Literal::from_opcode(&c.op).is_some());
        let (literals, others) = if literals.len() < 2 {
            (Vec::new(), self.children.iter().collect())
        } else {
            (literals, others)
        };

        let mut alternatives = Vec::new();
        for child in others {
            let saved = program.begin_chain();
            program.append(child.op.clone());
            child.next.emit(program)?;
            alternatives.push(detached_head(program, saved)?);
        }
        for tail in &self.tails {
            let saved = program.begin_chain();
            program.splice(tail);
            alternatives.push(detached_head(program, saved)?);
        }

        if literals.is_empty() {
            program.append(Opcode::Branch(alternatives));
            return Ok(());
        }

        let mut index = BranchIndex::new();
        for child in literals {
            let Some(literal) = Literal::from_opcode(&child.op) else {
                continue;
            };
            let saved = program.begin_chain();
            child.next.emit(program)?;
            let head = detached_head(program, saved)?;
            let branch = index.insert(literal, head);
            index.set_always(branch, branch_needs_always(program, head));
        }
        tracing::trace!(
            literals = index.len(),
            always = index.always().count(),
            "emitting literal branch"
        );

        if alternatives.is_empty() {
            program.append(Opcode::LiteralBranch(Box::new(index)));
        } else {
            let saved = program.begin_chain();
            program.append(Opcode::LiteralBranch(Box::new(index)));
            alternatives.push(detached_head(program, saved)?);
            program.append(Opcode::Branch(alternatives));
        }
        Ok(())
    }
}

fn detached_head(
    program: &mut Program,
    saved: crate::opcode::Chain,
) -> Result<OpcodeId, FilterError> {
    program
        .end_chain(saved)
        .ok_or_else(|| FilterError::InvalidProgram("empty filter continuation".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::DocumentBuilder;

    fn order(a: &str, with_b: bool) -> Document {
        let mut builder = DocumentBuilder::new().start("order", &[]).leaf("a", a);
        if with_b {
            builder = builder.leaf("b", "");
        }
        builder.end().finish()
    }

    fn count(program: &Program, name: &str) -> usize {
        program
            .ids()
            .into_iter()
            .filter(|id| program.op(*id).name() == name)
            .count()
    }

    #[test]
    fn shared_prefixes_are_emitted_once() {
        let mut table = FilterTable::new();
        table.add("order/a = 1", "one").unwrap();
        table.add("order/a = 2", "two").unwrap();
        table.add("order/b", "b").unwrap();

        let program = table.program();
        assert_eq!(count(program, "PushContextNode"), 1);
        assert_eq!(count(program, "LiteralBranch"), 1);
        assert_eq!(count(program, "Branch"), 1);
        assert_eq!(count(program, "NumberEquals"), 0);
        assert_eq!(count(program, "MatchFilter"), 3);

        assert_eq!(table.matching(&order("2", true)).unwrap(), [&"two", &"b"]);
        assert_eq!(table.matching(&order("1", false)).unwrap(), [&"one"]);
        assert!(table.matching(&order("3", false)).unwrap().is_empty());
    }

    #[test]
    fn only_the_matched_literal_branch_runs() {
        let mut table = FilterTable::new();
        for (i, literal) in ["x", "y", "z"].into_iter().enumerate() {
            table.add(&format!("order/a = '{literal}'"), i).unwrap();
        }
        let stats = ExecStats::new();
        let ids = table.matching_ids(&order("y", false), Some(&stats)).unwrap();
        assert_eq!(ids, HashSet::from([FilterId(1)]));
        assert_eq!(stats.count("LiteralBranch"), 1);
        assert_eq!(stats.count("MatchFilter"), 1);
    }

    #[test]
    fn always_branches_run_when_their_literal_misses() {
        let mut table = FilterTable::new();
        table.add("order/a = 'x' or order/b", "x-or-b").unwrap();
        table.add("order/a = 'y'", "y").unwrap();

        let stats = ExecStats::new();
        let doc = order("y", true);
        assert_eq!(table.matching(&doc).unwrap(), [&"x-or-b", &"y"]);
        table.matching_ids(&doc, Some(&stats)).unwrap();
        assert_eq!(stats.count("MatchFilter"), 2);

        stats.reset();
        let ids = table.matching_ids(&order("z", false), Some(&stats)).unwrap();
        assert!(ids.is_empty());
        assert_eq!(stats.count("MatchFilter"), 1);
    }

    #[test]
    fn get_match_rejects_ambiguity() {
        let mut table = FilterTable::new();
        table.add("order", 1).unwrap();
        table.add("order/a", 2).unwrap();
        assert_eq!(
            table.get_match(&order("1", false)),
            Err(FilterError::MultipleMatches)
        );

        let mut table = FilterTable::new();
        table.add("nothing", 1).unwrap();
        assert_eq!(table.get_match(&order("1", false)), Ok(None));
        table.add("order", 2).unwrap();
        assert_eq!(table.get_match(&order("1", false)), Ok(Some(&2)));
    }

    #[test]
    fn removed_filters_stop_matching() {
        let mut table = FilterTable::new();
        let a = table.add("order/a = 1", 'a').unwrap();
        table.add("order/a", 'b').unwrap();
        assert_eq!(table.remove(a).unwrap(), Some('a'));
        assert_eq!(table.remove(a).unwrap(), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.matching(&order("1", false)).unwrap(), [&'b']);
    }

    #[test]
    fn bad_filters_leave_the_table_unchanged() {
        let mut table = FilterTable::new();
        table.add("order", 1).unwrap();
        assert!(table.add("order[", 2).is_err());
        assert!(table.add("a[b[c[d[e]]]]", 3).is_err());
        assert_eq!(table.len(), 1);
        assert_eq!(table.matching(&order("1", false)).unwrap(), [&1]);
    }
}
