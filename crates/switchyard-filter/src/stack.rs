//! A stack with cheap checkpoint/restore.
//!
//! Branch alternatives must each start from the same stack state. Instead of
//! cloning the stack per alternative, a checkpoint records the current depth
//! and keeps an undo log of the items popped from below it:
//!
//! ```text
//!   checkpoint          pop, pop, push x        rewind
//!   [a b c d] low=4     [a b x]  saved=[d c]    [a b c d]
//! ```
//!
//! Only items that were actually consumed get cloned.

#[derive(Debug)]
struct Mark<T> {
    low: usize,
    saved: Vec<T>,
}

impl<T> Mark<T> {
    /// Depth below which this mark has not lost anything.
    fn floor(&self) -> usize {
        self.low - self.saved.len()
    }
}

#[derive(Debug)]
pub(crate) struct BranchStack<T> {
    items: Vec<T>,
    marks: Vec<Mark<T>>,
}

impl<T: Clone> BranchStack<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop()?;
        let index = self.items.len();
        for mark in &mut self.marks {
            if index < mark.floor() {
                mark.saved.push(item.clone());
            }
        }
        Some(item)
    }

    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn checkpoint(&mut self) {
        self.marks.push(Mark {
            low: self.items.len(),
            saved: Vec::new(),
        });
    }

    /// Return to the innermost checkpoint's state. The checkpoint stays in
    /// place for the next alternative.
    pub fn rewind(&mut self) {
        let Some(mark) = self.marks.last_mut() else {
            return;
        };
        self.items.truncate(mark.floor());
        self.items.extend(mark.saved.drain(..).rev());
    }

    /// Drop the innermost checkpoint; later pops are no longer recorded
    /// against it.
    pub fn release(&mut self) {
        self.marks.pop();
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.marks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(items: &[u32]) -> BranchStack<u32> {
        let mut s = BranchStack::new();
        for i in items {
            s.push(*i);
        }
        s
    }

    fn contents(s: &BranchStack<u32>) -> Vec<u32> {
        s.items.clone()
    }

    #[test]
    fn rewind_restores_consumed_items() {
        let mut s = stack(&[1, 2, 3, 4]);
        s.checkpoint();
        s.pop();
        s.pop();
        s.push(9);
        s.push(8);
        s.push(7);
        s.rewind();
        assert_eq!(contents(&s), [1, 2, 3, 4]);
        s.pop();
        s.rewind();
        assert_eq!(contents(&s), [1, 2, 3, 4]);
        s.release();
        s.pop();
        assert_eq!(contents(&s), [1, 2, 3]);
    }

    #[test]
    fn nested_checkpoints_restore_independently() {
        let mut s = stack(&[1, 2, 3, 4, 5]);
        s.checkpoint();
        s.pop();
        s.pop();
        s.checkpoint();
        s.pop();
        s.pop();
        s.push(6);
        s.rewind();
        assert_eq!(contents(&s), [1, 2, 3]);
        s.release();
        s.pop();
        s.push(7);
        s.rewind();
        assert_eq!(contents(&s), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn pushes_above_the_checkpoint_are_discarded() {
        let mut s = stack(&[1]);
        s.checkpoint();
        s.push(2);
        s.push(3);
        s.pop();
        s.rewind();
        assert_eq!(contents(&s), [1]);
    }
}
