//! Block System
//!
//! Ordered slot containers with flexible placement
//!
//! Items added with [`Positions::Linear`] take the next free slot. Items
//! added with a constraint (for example `"1,3-5"`) are placed when the block
//! is finalized: the most constrained item is placed first, on a random slot
//! among its remaining candidates.
//!
//! Blocks nest. They live in a [`BlockArena`] and refer to each other by
//! [`BlockId`]; traversal walks the tree depth-first.

use std::collections::BTreeSet;

use rand::Rng;

use crate::error::{PlotError, PlotResult};
use crate::plan::SequenceKind;

/// Index of a block inside its arena
pub type BlockId = usize;

/// Id of the outermost block of every stager
pub const ROOT_BLOCK: BlockId = 0;

/// Where an item may be placed inside its block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Positions {
    /// Next sequential slot
    #[default]
    Linear,
    /// Constraint over 0-based slot indices: `"2"`, `"1-3"`, `"0,2"`,
    /// `"<2"`, `">=1"`, `"*"`
    Constraint(String),
}

impl From<&str> for Positions {
    fn from(value: &str) -> Self {
        if value.is_empty() || value == "linear" {
            Positions::Linear
        } else {
            Positions::Constraint(value.to_string())
        }
    }
}

impl From<String> for Positions {
    fn from(value: String) -> Self {
        Positions::from(value.as_str())
    }
}

impl From<usize> for Positions {
    fn from(value: usize) -> Self {
        Positions::Constraint(value.to_string())
    }
}

impl From<Option<&str>> for Positions {
    fn from(value: Option<&str>) -> Self {
        value.map(Positions::from).unwrap_or_default()
    }
}

/// Stage marker placed at the head of a stage's enclosing block
#[derive(Debug, Clone)]
pub struct StageItem {
    /// Sequence id (alias if one was given)
    pub id: String,
    /// Registered stage id
    pub stage: String,
    pub kind: SequenceKind,
}

/// Leaf item of the block tree
#[derive(Debug, Clone)]
pub enum PlanItem {
    Stage(StageItem),
    Step { stage: String, step: String },
}

impl PlanItem {
    fn matches(&self, id: &str) -> bool {
        match self {
            PlanItem::Stage(s) => s.id == id,
            PlanItem::Step { step, .. } => step == id,
        }
    }
}

/// Content of a block slot
#[derive(Debug, Clone)]
pub enum Slot {
    Item(PlanItem),
    Block(BlockId),
}

/// Role of a block in the stager's tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Outermost block
    Root,
    /// User block grouping stages
    StageGroup,
    /// Automatic block enclosing one stage marker and its steps
    Stage,
    /// Automatic block holding the steps of a stage
    Steps,
    /// User block grouping steps of the current stage
    StepGroup,
}

#[derive(Debug, Clone)]
struct Pending {
    slot: Slot,
    positions: String,
    candidates: Vec<usize>,
}

/// Saved pre-finalize state of a block
#[derive(Debug, Clone)]
struct BlockSnapshot {
    items: Vec<Option<Slot>>,
    taken: Vec<usize>,
    unfinished: Vec<Pending>,
    index: usize,
    finalized: bool,
}

/// Ordered container of slots
#[derive(Debug, Clone)]
pub struct Block {
    id: String,
    kind: BlockKind,
    positions: Positions,
    /// Slot array; `None` marks a slot reserved for a flexible item
    items: Vec<Option<Slot>>,
    taken: Vec<usize>,
    unfinished: Vec<Pending>,
    index: usize,
    finalized: bool,
    snapshot: Option<BlockSnapshot>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind, positions: Positions) -> Self {
        Self {
            id: id.into(),
            kind,
            positions,
            items: Vec::new(),
            taken: Vec::new(),
            unfinished: Vec::new(),
            index: 0,
            finalized: false,
            snapshot: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Placement of this block inside its parent
    pub fn positions(&self) -> &Positions {
        &self.positions
    }

    /// Number of items added so far, placed or pending
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Add an item, either in the next slot or pending until finalize
    pub fn add(&mut self, slot: Slot, positions: Positions) -> PlotResult<()> {
        if self.finalized {
            return Err(PlotError::Block(format!(
                "cannot add to finalized block '{}'",
                self.id
            )));
        }
        match positions {
            Positions::Linear => {
                self.taken.push(self.items.len());
                self.items.push(Some(slot));
            }
            Positions::Constraint(expr) => {
                self.unfinished.push(Pending {
                    slot,
                    positions: expr,
                    candidates: Vec::new(),
                });
                self.items.push(None);
            }
        }
        Ok(())
    }

    /// True if a stage or step with this id was already added
    pub fn has_item(&self, id: &str) -> bool {
        let placed = self.items.iter().flatten();
        let pending = self.unfinished.iter().map(|p| &p.slot);
        placed
            .chain(pending)
            .any(|slot| matches!(slot, Slot::Item(item) if item.matches(id)))
    }

    /// Place every pending item. Idempotent.
    pub fn finalize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> PlotResult<()> {
        if self.finalized {
            return Ok(());
        }
        let total = self.items.len();
        let available: Vec<usize> = (0..total).filter(|i| !self.taken.contains(i)).collect();

        let mut pending = std::mem::take(&mut self.unfinished);
        for entry in pending.iter_mut() {
            let allowed = parse_positions(&entry.positions, total)?;
            entry.candidates = available
                .iter()
                .copied()
                .filter(|i| allowed.contains(i))
                .collect();
        }

        // Most constrained entry last, then popped.
        while !pending.is_empty() {
            pending.sort_by(|a, b| b.candidates.len().cmp(&a.candidates.len()));
            let Some(entry) = pending.pop() else {
                break;
            };
            if entry.candidates.is_empty() {
                return Err(PlotError::Unsatisfiable {
                    block: self.id.clone(),
                    positions: entry.positions,
                });
            }
            let choice = entry.candidates[rng.random_range(0..entry.candidates.len())];
            log::trace!(
                "Block '{}': placed item with positions '{}' at {}",
                self.id,
                entry.positions,
                choice
            );
            if let Some(slot) = self.items.get_mut(choice) {
                *slot = Some(entry.slot);
            }
            self.taken.push(choice);
            for other in pending.iter_mut() {
                other.candidates.retain(|c| *c != choice);
            }
        }

        self.finalized = true;
        Ok(())
    }

    /// Save the current state for a later [`Block::restore`]
    pub fn backup(&mut self) {
        self.snapshot = Some(BlockSnapshot {
            items: self.items.clone(),
            taken: self.taken.clone(),
            unfinished: self.unfinished.clone(),
            index: self.index,
            finalized: self.finalized,
        });
    }

    /// Return to the state saved by [`Block::backup`], if any
    pub fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.items = snapshot.items;
            self.taken = snapshot.taken;
            self.unfinished = snapshot.unfinished;
            self.index = snapshot.index;
            self.finalized = snapshot.finalized;
        }
    }

    /// Move the traversal cursor back to the first slot
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Slots in order; unplaced slots are `None`
    pub fn slots(&self) -> impl Iterator<Item = Option<&Slot>> {
        self.items.iter().map(|s| s.as_ref())
    }
}

/// Parse a positions expression into slot indices below `total`
pub fn parse_positions(expr: &str, total: usize) -> PlotResult<BTreeSet<usize>> {
    let invalid = || PlotError::InvalidPositions(expr.to_string());
    let number = |s: &str| s.trim().parse::<usize>().map_err(|_| invalid());
    let after = |n: usize| n.checked_add(1).ok_or_else(invalid);

    let mut out = BTreeSet::new();
    for token in expr.split(',').map(str::trim) {
        if token.is_empty() {
            return Err(invalid());
        }
        // half-open [start, end)
        let (start, end) = if token == "*" {
            (0, total)
        } else if let Some(n) = token.strip_prefix("<=") {
            (0, after(number(n)?)?)
        } else if let Some(n) = token.strip_prefix(">=") {
            (number(n)?, total)
        } else if let Some(n) = token.strip_prefix('<') {
            (0, number(n)?)
        } else if let Some(n) = token.strip_prefix('>') {
            (after(number(n)?)?, total)
        } else if let Some((a, b)) = token.split_once("..").or_else(|| token.split_once('-')) {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(invalid());
            }
            (a, after(b)?)
        } else {
            let n = number(token)?;
            (n, after(n)?)
        };
        out.extend(start..end.min(total));
    }
    Ok(out)
}

/// Owner of all blocks of a stager
#[derive(Debug, Clone)]
pub struct BlockArena {
    blocks: Vec<Block>,
}

impl BlockArena {
    /// Arena containing only the root block
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::new("__root", BlockKind::Root, Positions::Linear)],
        }
    }

    pub fn create(
        &mut self,
        id: impl Into<String>,
        kind: BlockKind,
        positions: Positions,
    ) -> BlockId {
        self.blocks.push(Block::new(id, kind, positions));
        self.blocks.len() - 1
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id)
    }

    /// Add a slot to a block
    pub fn add(&mut self, id: BlockId, slot: Slot, positions: Positions) -> PlotResult<()> {
        self.blocks
            .get_mut(id)
            .ok_or_else(|| PlotError::Block(format!("no block #{}", id)))?
            .add(slot, positions)
    }

    /// Add a new child block to `parent`, placed by the child's positions
    pub fn nest(
        &mut self,
        parent: BlockId,
        id: impl Into<String>,
        kind: BlockKind,
        positions: Positions,
    ) -> PlotResult<BlockId> {
        let child = self.create(id, kind, positions.clone());
        self.add(parent, Slot::Block(child), positions)?;
        Ok(child)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn finalize_all<R: Rng + ?Sized>(&mut self, rng: &mut R) -> PlotResult<()> {
        for block in self.blocks.iter_mut() {
            block.finalize(rng)?;
        }
        Ok(())
    }

    pub fn backup_all(&mut self) {
        self.blocks.iter_mut().for_each(Block::backup);
    }

    pub fn restore_all(&mut self) {
        self.blocks.iter_mut().for_each(Block::restore);
    }

    pub fn rewind_all(&mut self) {
        self.blocks.iter_mut().for_each(Block::rewind);
    }

    /// Next leaf item below `id`, descending into nested blocks.
    /// Returns `None` once the block is exhausted.
    pub fn next(&mut self, id: BlockId) -> Option<PlanItem> {
        loop {
            let block = self.blocks.get_mut(id)?;
            let slot = block.items.get(block.index)?.clone();
            match slot {
                Some(Slot::Item(item)) => {
                    block.index += 1;
                    return Some(item);
                }
                Some(Slot::Block(child)) => {
                    if let Some(item) = self.next(child) {
                        return Some(item);
                    }
                    self.blocks.get_mut(id)?.index += 1;
                }
                None => block.index += 1,
            }
        }
    }
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn step(id: &str) -> Slot {
        Slot::Item(PlanItem::Step {
            stage: "stage".to_string(),
            step: id.to_string(),
        })
    }

    fn order(block: &Block) -> Vec<String> {
        block
            .slots()
            .map(|slot| match slot {
                Some(Slot::Item(PlanItem::Step { step, .. })) => step.clone(),
                other => panic!("unexpected slot {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_parse_positions() {
        let set = |e: &str| parse_positions(e, 6).unwrap().into_iter().collect::<Vec<_>>();
        assert_eq!(set("2"), vec![2]);
        assert_eq!(set("1,3-5"), vec![1, 3, 4, 5]);
        assert_eq!(set("0..2"), vec![0, 1, 2]);
        assert_eq!(set("<2"), vec![0, 1]);
        assert_eq!(set("<=2"), vec![0, 1, 2]);
        assert_eq!(set(">3"), vec![4, 5]);
        assert_eq!(set(">=4"), vec![4, 5]);
        assert_eq!(set("*"), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(set("9"), Vec::<usize>::new());
        assert!(parse_positions("3-1", 6).is_err());
        assert!(parse_positions("a", 6).is_err());
        assert!(parse_positions("1,,2", 6).is_err());
    }

    #[test]
    fn test_parse_positions_at_usize_max() {
        let max = usize::MAX;
        let rejected = [
            format!("<={}", max),
            format!(">{}", max),
            format!("{}", max),
            format!("0-{}", max),
        ];
        for expr in rejected {
            let result = parse_positions(&expr, 3);
            assert!(
                matches!(result, Err(PlotError::InvalidPositions(e)) if e == expr),
                "{} should be rejected",
                expr
            );
        }
        let below = max - 1;
        let set = parse_positions(&format!("1..{}", below), 3).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(parse_positions(&format!(">={}", max), 3).unwrap().is_empty());
    }

    #[test]
    fn test_linear_and_constrained() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut block = Block::new("b", BlockKind::Steps, Positions::Linear);
        block.add(step("A"), Positions::Linear).unwrap();
        block.add(step("B"), Positions::from("1")).unwrap();
        block.add(step("C"), Positions::Linear).unwrap();
        block.finalize(&mut rng).unwrap();

        assert!(block.is_finalized());
        assert_eq!(order(&block), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_unsatisfiable() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut block = Block::new("b", BlockKind::Steps, Positions::Linear);
        block.add(step("X"), Positions::from("1")).unwrap();
        block.add(step("Y"), Positions::from("1")).unwrap();
        let err = block.finalize(&mut rng).unwrap_err();
        assert!(matches!(err, PlotError::Unsatisfiable { .. }));
    }

    #[test]
    fn test_most_constrained_first() {
        // "*" could steal slot 0 if placed first; "0" must still get it.
        for seed in 0..32 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut block = Block::new("b", BlockKind::Steps, Positions::Linear);
            block.add(step("any"), Positions::from("*")).unwrap();
            block.add(step("first"), Positions::from("0")).unwrap();
            block.add(step("lin"), Positions::Linear).unwrap();
            block.finalize(&mut rng).unwrap();
            assert_eq!(order(&block), vec!["first", "any", "lin"]);
        }
    }

    #[test]
    fn test_finalize_idempotent_and_add_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut block = Block::new("b", BlockKind::Steps, Positions::Linear);
        block.add(step("A"), Positions::Linear).unwrap();
        block.finalize(&mut rng).unwrap();
        block.finalize(&mut rng).unwrap();
        assert!(block.add(step("B"), Positions::Linear).is_err());
    }

    #[test]
    fn test_has_item() {
        let mut block = Block::new("b", BlockKind::Steps, Positions::Linear);
        block.add(step("A"), Positions::Linear).unwrap();
        block.add(step("B"), Positions::from("0")).unwrap();
        assert!(block.has_item("A"));
        assert!(block.has_item("B"));
        assert!(!block.has_item("C"));
    }

    #[test]
    fn test_backup_restore() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut block = Block::new("b", BlockKind::Steps, Positions::Linear);
        block.add(step("A"), Positions::from("*")).unwrap();
        block.add(step("B"), Positions::from("*")).unwrap();
        block.backup();
        block.finalize(&mut rng).unwrap();
        assert!(block.slots().all(|s| s.is_some()));

        block.restore();
        assert!(!block.is_finalized());
        assert!(block.slots().all(|s| s.is_none()));
        block.finalize(&mut rng).unwrap();
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_arena_traversal() {
        let mut arena = BlockArena::new();
        arena.add(ROOT_BLOCK, step("a"), Positions::Linear).unwrap();
        let child = arena
            .nest(ROOT_BLOCK, "child", BlockKind::StageGroup, Positions::Linear)
            .unwrap();
        arena.nest(child, "empty", BlockKind::StageGroup, Positions::Linear).unwrap();
        arena.add(child, step("b"), Positions::Linear).unwrap();
        arena.add(ROOT_BLOCK, step("c"), Positions::Linear).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        arena.finalize_all(&mut rng).unwrap();

        let mut seen = Vec::new();
        while let Some(item) = arena.next(ROOT_BLOCK) {
            if let PlanItem::Step { step, .. } = item {
                seen.push(step);
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(arena.next(ROOT_BLOCK).is_none());

        arena.rewind_all();
        assert!(arena.next(ROOT_BLOCK).is_some());
    }
}
