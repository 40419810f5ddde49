//! Per-asset ordered index of active troves.
//!
//! Each collateral asset owns a doubly-linked [`SortedList`] ordered by
//! nominal collateral ratio, ascending: the head is the least healthy
//! trove and is where liquidation and redemption walks begin.
//!
//! Insertion takes a `(prev, next)` hint. A hint that is still correct
//! costs O(1); a stale one is corrected by walking from the hint, bounded
//! by `max_steps`. The index stores only the ranking key, never debt or
//! collateral.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Ordered-index failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("trove {0} is already in the index")]
    AlreadyPresent(Address),

    #[error("index is full ({max_size} troves)")]
    Full { max_size: usize },

    #[error("no valid insert position found within {steps} steps")]
    InvalidHints { steps: usize },

    #[error("trove {0} is not in the index")]
    NotFound(Address),

    #[error("health metric must be non-zero")]
    ZeroHealthMetric,

    #[error("asset {0} has no index")]
    UnknownAsset(Address),
}

/// Linked-list node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Ranking key (NICR)
    pub key: U256,
    pub prev: Option<Address>,
    pub next: Option<Address>,
}

/// A position between two neighbours, used both as an insertion hint and
/// as a search result. `None` on either side means the list boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub prev: Option<Address>,
    pub next: Option<Address>,
}

impl Slot {
    pub fn new(prev: Option<Address>, next: Option<Address>) -> Self {
        Self { prev, next }
    }
}

/// Outcome of a bounded hint search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    Found(Slot),
    Exhausted { steps: usize },
}

/// Doubly-linked list of troves for one asset, ascending by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortedList {
    head: Option<Address>,
    tail: Option<Address>,
    max_size: usize,
    nodes: HashMap<Address, Node>,
}

impl SortedList {
    pub fn new(max_size: usize) -> Self {
        Self {
            head: None,
            tail: None,
            max_size,
            nodes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains(&self, id: Address) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn key_of(&self, id: Address) -> Option<U256> {
        self.nodes.get(&id).map(|n| n.key)
    }

    pub fn node(&self, id: Address) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Least healthy trove.
    pub fn first(&self) -> Option<Address> {
        self.head
    }

    /// Healthiest trove.
    pub fn last(&self) -> Option<Address> {
        self.tail
    }

    pub fn next(&self, id: Address) -> Option<Address> {
        self.nodes.get(&id).and_then(|n| n.next)
    }

    pub fn prev(&self, id: Address) -> Option<Address> {
        self.nodes.get(&id).and_then(|n| n.prev)
    }

    /// Iterate from head (least healthy) to tail.
    pub fn iter(&self) -> impl Iterator<Item = (Address, U256)> + '_ {
        std::iter::successors(self.head, move |id| self.next(*id))
            .filter_map(move |id| self.key_of(id).map(|key| (id, key)))
    }

    /// Whether inserting `key` between `slot.prev` and `slot.next` keeps the
    /// list ordered.
    pub fn valid_position(&self, key: U256, slot: Slot) -> bool {
        View::new(self, &[]).valid(key, slot)
    }

    /// Exact insert position by scanning from the head.
    pub fn find_insert_position(&self, key: U256, hint: Slot) -> Slot {
        match search(self, key, hint, usize::MAX, &[]) {
            Search::Found(slot) => slot,
            // Unbounded searches always terminate on a valid slot
            Search::Exhausted { .. } => Slot::new(self.tail, None),
        }
    }

    /// Insert `id` with `key`, correcting a stale hint within `max_steps`.
    pub fn insert(
        &mut self,
        id: Address,
        key: U256,
        hint: Slot,
        max_steps: usize,
    ) -> Result<Slot, IndexError> {
        let slot = self.plan_insert(id, key, hint, max_steps, &[])?;
        self.insert_at(id, key, slot);
        Ok(slot)
    }

    /// Validate an insertion against the list as it will look once
    /// `excluded` ids are gone. Read-only.
    pub fn plan_insert(
        &self,
        id: Address,
        key: U256,
        hint: Slot,
        max_steps: usize,
        excluded: &[Address],
    ) -> Result<Slot, IndexError> {
        if key.is_zero() {
            return Err(IndexError::ZeroHealthMetric);
        }
        let present = self.contains(id) && !excluded.contains(&id);
        if present {
            return Err(IndexError::AlreadyPresent(id));
        }
        let live = self
            .nodes
            .keys()
            .filter(|k| !excluded.contains(k))
            .count();
        if live >= self.max_size {
            return Err(IndexError::Full {
                max_size: self.max_size,
            });
        }
        match search(self, key, hint, max_steps, excluded) {
            Search::Found(slot) => Ok(slot),
            Search::Exhausted { steps } => Err(IndexError::InvalidHints { steps }),
        }
    }

    /// Link `id` into a slot previously returned by [`Self::plan_insert`].
    ///
    /// The slot must be valid for the current list.
    pub fn insert_at(&mut self, id: Address, key: U256, slot: Slot) {
        match slot.prev {
            Some(prev) => {
                if let Some(node) = self.nodes.get_mut(&prev) {
                    node.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match slot.next {
            Some(next) => {
                if let Some(node) = self.nodes.get_mut(&next) {
                    node.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
        self.nodes.insert(
            id,
            Node {
                key,
                prev: slot.prev,
                next: slot.next,
            },
        );
    }

    /// Unlink `id`, returning its node.
    pub fn remove(&mut self, id: Address) -> Result<Node, IndexError> {
        let node = self.nodes.remove(&id).ok_or(IndexError::NotFound(id))?;
        match node.prev {
            Some(prev) => {
                if let Some(p) = self.nodes.get_mut(&prev) {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.nodes.get_mut(&next) {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        Ok(node)
    }

    /// Move `id` to the position for `new_key`. On failure the node is
    /// restored to its old slot with its old key.
    pub fn reinsert(
        &mut self,
        id: Address,
        new_key: U256,
        hint: Slot,
        max_steps: usize,
    ) -> Result<Slot, IndexError> {
        if new_key.is_zero() {
            return Err(IndexError::ZeroHealthMetric);
        }
        let old = self.remove(id)?;
        match self.insert(id, new_key, hint, max_steps) {
            Ok(slot) => Ok(slot),
            Err(e) => {
                self.insert_at(id, old.key, Slot::new(old.prev, old.next));
                Err(e)
            }
        }
    }
}

/// Read view of a list with some ids treated as already removed.
struct View<'a> {
    list: &'a SortedList,
    excluded: &'a [Address],
}

impl<'a> View<'a> {
    fn new(list: &'a SortedList, excluded: &'a [Address]) -> Self {
        Self { list, excluded }
    }

    fn live(&self, id: Address) -> bool {
        self.list.contains(id) && !self.excluded.contains(&id)
    }

    fn key(&self, id: Address) -> U256 {
        self.list.key_of(id).unwrap_or_default()
    }

    fn skip_forward(&self, mut cursor: Option<Address>) -> Option<Address> {
        while let Some(id) = cursor {
            if !self.excluded.contains(&id) {
                return Some(id);
            }
            cursor = self.list.next(id);
        }
        None
    }

    fn skip_backward(&self, mut cursor: Option<Address>) -> Option<Address> {
        while let Some(id) = cursor {
            if !self.excluded.contains(&id) {
                return Some(id);
            }
            cursor = self.list.prev(id);
        }
        None
    }

    fn head(&self) -> Option<Address> {
        self.skip_forward(self.list.head)
    }

    fn tail(&self) -> Option<Address> {
        self.skip_backward(self.list.tail)
    }

    fn next(&self, id: Address) -> Option<Address> {
        self.skip_forward(self.list.next(id))
    }

    fn prev(&self, id: Address) -> Option<Address> {
        self.skip_backward(self.list.prev(id))
    }

    fn valid(&self, key: U256, slot: Slot) -> bool {
        match (slot.prev, slot.next) {
            (None, None) => self.head().is_none(),
            (None, Some(next)) => {
                self.live(next) && self.head() == Some(next) && key <= self.key(next)
            }
            (Some(prev), None) => {
                self.live(prev) && self.tail() == Some(prev) && key >= self.key(prev)
            }
            (Some(prev), Some(next)) => {
                self.live(prev)
                    && self.live(next)
                    && self.next(prev) == Some(next)
                    && self.key(prev) <= key
                    && key <= self.key(next)
            }
        }
    }
}

/// Find a slot for `key`, starting from `hint` and taking at most
/// `max_steps` hops. Ids in `excluded` are treated as already removed.
///
/// A neighbour that is gone or on the wrong side of `key` is dropped from
/// the hint; the walk then starts from the surviving neighbour, or from
/// the head when neither survives.
pub fn search(
    list: &SortedList,
    key: U256,
    hint: Slot,
    max_steps: usize,
    excluded: &[Address],
) -> Search {
    let view = View::new(list, excluded);

    let Some(head) = view.head() else {
        return Search::Found(Slot::default());
    };
    if view.valid(key, hint) {
        return Search::Found(hint);
    }

    let prev = hint
        .prev
        .filter(|p| view.live(*p) && view.key(*p) <= key);
    let next = hint
        .next
        .filter(|n| view.live(*n) && view.key(*n) >= key);

    match (prev, next) {
        (Some(start), _) => walk_toward_tail(&view, key, start, max_steps),
        (None, Some(start)) => walk_toward_head(&view, key, start, max_steps),
        (None, None) => walk_toward_tail(&view, key, head, max_steps),
    }
}

fn walk_toward_tail(view: &View<'_>, key: U256, start: Address, max_steps: usize) -> Search {
    if view.head() == Some(start) && key <= view.key(start) {
        return Search::Found(Slot::new(None, Some(start)));
    }

    let mut steps = 0usize;
    let mut prev = start;
    loop {
        let next = view.next(prev);
        let slot = Slot::new(Some(prev), next);
        if view.valid(key, slot) {
            return Search::Found(slot);
        }
        steps += 1;
        match next {
            Some(n) if steps <= max_steps => prev = n,
            _ => return Search::Exhausted { steps },
        }
    }
}

fn walk_toward_head(view: &View<'_>, key: U256, start: Address, max_steps: usize) -> Search {
    if view.tail() == Some(start) && key >= view.key(start) {
        return Search::Found(Slot::new(Some(start), None));
    }

    let mut steps = 0usize;
    let mut next = start;
    loop {
        let prev = view.prev(next);
        let slot = Slot::new(prev, Some(next));
        if view.valid(key, slot) {
            return Search::Found(slot);
        }
        steps += 1;
        match prev {
            Some(p) if steps <= max_steps => next = p,
            _ => return Search::Exhausted { steps },
        }
    }
}

/// Ordered indexes for every registered collateral asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SortedTroves {
    lists: HashMap<Address, SortedList>,
}

impl SortedTroves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty index for `asset`. Re-registering keeps the
    /// existing list.
    pub fn register(&mut self, asset: Address, max_size: usize) {
        self.lists
            .entry(asset)
            .or_insert_with(|| SortedList::new(max_size));
    }

    pub fn list(&self, asset: Address) -> Result<&SortedList, IndexError> {
        self.lists.get(&asset).ok_or(IndexError::UnknownAsset(asset))
    }

    pub fn list_mut(&mut self, asset: Address) -> Result<&mut SortedList, IndexError> {
        self.lists
            .get_mut(&asset)
            .ok_or(IndexError::UnknownAsset(asset))
    }

    pub fn assets(&self) -> impl Iterator<Item = Address> + '_ {
        self.lists.keys().copied()
    }

    pub fn insert(
        &mut self,
        asset: Address,
        id: Address,
        key: U256,
        hint: Slot,
        max_steps: usize,
    ) -> Result<Slot, IndexError> {
        self.list_mut(asset)?.insert(id, key, hint, max_steps)
    }

    pub fn remove(&mut self, asset: Address, id: Address) -> Result<Node, IndexError> {
        self.list_mut(asset)?.remove(id)
    }

    pub fn reinsert(
        &mut self,
        asset: Address,
        id: Address,
        new_key: U256,
        hint: Slot,
        max_steps: usize,
    ) -> Result<Slot, IndexError> {
        self.list_mut(asset)?.reinsert(id, new_key, hint, max_steps)
    }

    pub fn contains(&self, asset: Address, id: Address) -> bool {
        self.lists.get(&asset).is_some_and(|l| l.contains(id))
    }

    pub fn len(&self, asset: Address) -> usize {
        self.lists.get(&asset).map_or(0, SortedList::len)
    }

    pub fn first(&self, asset: Address) -> Option<Address> {
        self.lists.get(&asset).and_then(SortedList::first)
    }

    pub fn find_insert_position(
        &self,
        asset: Address,
        key: U256,
        hint: Slot,
    ) -> Result<Slot, IndexError> {
        Ok(self.list(asset)?.find_insert_position(key, hint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn k(n: u64) -> U256 {
        U256::from(n)
    }

    fn keys(list: &SortedList) -> Vec<u64> {
        list.iter().map(|(_, key)| key.to::<u64>()).collect()
    }

    fn filled(entries: &[(u8, u64)]) -> SortedList {
        let mut list = SortedList::new(100);
        for (n, key) in entries {
            list.insert(id(*n), k(*key), Slot::default(), usize::MAX).unwrap();
        }
        list
    }

    #[test]
    fn test_insert_keeps_ascending_order() {
        let list = filled(&[(1, 50), (2, 10), (3, 30), (4, 70), (5, 30)]);
        assert_eq!(keys(&list), vec![10, 30, 30, 50, 70]);
        assert_eq!(list.first(), Some(id(2)));
        assert_eq!(list.last(), Some(id(4)));
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_exact_hint_is_used() {
        let mut list = filled(&[(1, 10), (2, 30)]);
        let slot = Slot::new(Some(id(1)), Some(id(2)));
        assert!(list.valid_position(k(20), slot));
        assert_eq!(list.insert(id(3), k(20), slot, 0).unwrap(), slot);
        assert_eq!(keys(&list), vec![10, 20, 30]);
    }

    #[test]
    fn test_stale_hint_is_corrected() {
        let mut list = filled(&[(1, 10), (2, 20), (3, 30), (4, 40)]);
        // Hint points at the head, real slot is between 30 and 40
        let slot = list
            .insert(id(9), k(35), Slot::new(Some(id(1)), Some(id(2))), 10)
            .unwrap();
        assert_eq!(slot, Slot::new(Some(id(3)), Some(id(4))));

        // Only a next-side hint, walks toward the head
        let slot = list
            .insert(id(8), k(15), Slot::new(None, Some(id(3))), 10)
            .unwrap();
        assert_eq!(slot, Slot::new(Some(id(1)), Some(id(2))));
    }

    #[test]
    fn test_bounded_scan_gives_invalid_hints() {
        let mut list = filled(&[(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
        let err = list
            .insert(id(9), k(45), Slot::new(Some(id(1)), None), 1)
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidHints { .. }));
        assert!(!list.contains(id(9)));
    }

    #[test]
    fn test_insert_errors() {
        let mut list = SortedList::new(2);
        assert_eq!(
            list.insert(id(1), U256::ZERO, Slot::default(), 10),
            Err(IndexError::ZeroHealthMetric)
        );
        list.insert(id(1), k(1), Slot::default(), 10).unwrap();
        assert_eq!(
            list.insert(id(1), k(2), Slot::default(), 10),
            Err(IndexError::AlreadyPresent(id(1)))
        );
        list.insert(id(2), k(2), Slot::default(), 10).unwrap();
        assert_eq!(
            list.insert(id(3), k(3), Slot::default(), 10),
            Err(IndexError::Full { max_size: 2 })
        );
    }

    #[test]
    fn test_remove_relinks_neighbours() {
        let mut list = filled(&[(1, 10), (2, 20), (3, 30)]);
        list.remove(id(2)).unwrap();
        assert_eq!(list.next(id(1)), Some(id(3)));
        assert_eq!(list.prev(id(3)), Some(id(1)));

        list.remove(id(1)).unwrap();
        assert_eq!(list.first(), Some(id(3)));
        list.remove(id(3)).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert_eq!(list.last(), None);
        assert_eq!(list.remove(id(3)), Err(IndexError::NotFound(id(3))));
    }

    #[test]
    fn test_reinsert_moves_node() {
        let mut list = filled(&[(1, 10), (2, 20), (3, 30)]);
        list.reinsert(id(1), k(40), Slot::default(), usize::MAX).unwrap();
        assert_eq!(keys(&list), vec![20, 30, 40]);
        assert_eq!(list.last(), Some(id(1)));
    }

    #[test]
    fn test_failed_reinsert_restores_old_slot() {
        let mut list = filled(&[(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
        let err = list
            .reinsert(id(2), k(45), Slot::new(Some(id(1)), None), 0)
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidHints { .. }));
        assert_eq!(keys(&list), vec![10, 20, 30, 40, 50]);
        assert_eq!(list.key_of(id(2)), Some(k(20)));
        assert_eq!(list.next(id(1)), Some(id(2)));
    }

    #[test]
    fn test_search_with_excluded_ids() {
        let list = filled(&[(1, 10), (2, 20), (3, 30), (4, 40)]);
        // Once 1 and 2 are gone, 15 goes in front of 3
        let found = search(&list, k(15), Slot::default(), 10, &[id(1), id(2)]);
        assert_eq!(found, Search::Found(Slot::new(None, Some(id(3)))));

        // A hint naming an excluded node is ignored
        let found = search(&list, k(35), Slot::new(Some(id(2)), None), 10, &[id(2)]);
        assert_eq!(found, Search::Found(Slot::new(Some(id(3)), Some(id(4)))));

        let found = search(&list, k(5), Slot::default(), 10, &[id(1), id(2), id(3), id(4)]);
        assert_eq!(found, Search::Found(Slot::default()));
    }

    #[test]
    fn test_find_insert_position() {
        let list = filled(&[(1, 10), (2, 20)]);
        assert_eq!(
            list.find_insert_position(k(5), Slot::default()),
            Slot::new(None, Some(id(1)))
        );
        assert_eq!(
            list.find_insert_position(k(25), Slot::default()),
            Slot::new(Some(id(2)), None)
        );
    }

    #[test]
    fn test_sorted_troves_per_asset() {
        let weth = id(0xAA);
        let wbtc = id(0xBB);
        let mut troves = SortedTroves::new();
        troves.register(weth, 10);
        troves.register(wbtc, 10);

        troves.insert(weth, id(1), k(5), Slot::default(), 10).unwrap();
        assert!(troves.contains(weth, id(1)));
        assert!(!troves.contains(wbtc, id(1)));
        assert_eq!(troves.first(weth), Some(id(1)));
        assert_eq!(troves.len(wbtc), 0);

        let unknown = id(0xCC);
        assert_eq!(
            troves.insert(unknown, id(1), k(5), Slot::default(), 10),
            Err(IndexError::UnknownAsset(unknown))
        );
    }
}
