//! Binary max-heap over arena-allocated records.
//!
//! The heap stores stable arena handles rather than the records themselves.
//! Each record carries its own 1-indexed node id, which the heap keeps equal
//! to the record's slot position (`slots[node_id - 1] == handle`) across every
//! swap. A node id of zero means "not in a heap".

/// Stable handle into a record arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub usize);

/// Arena access the heap needs: a priority key and a mutable node id per record.
pub trait HeapArena {
  fn key(&self, id: RecordId) -> u64;
  fn node_id(&self, id: RecordId) -> usize;
  fn set_node_id(&mut self, id: RecordId, node_id: usize);
}

/// Max-heap ordered by `HeapArena::key`; the root is the most recently written record.
#[derive(Debug, Default, Clone)]
pub struct PriorityIndex {
  slots: Vec<RecordId>,
}

impl PriorityIndex {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Handles in slot order (slot 0 is the root).
  pub fn slots(&self) -> &[RecordId] {
    &self.slots
  }

  pub fn peek(&self) -> Option<RecordId> {
    self.slots.first().copied()
  }

  pub fn insert<A: HeapArena>(&mut self, arena: &mut A, id: RecordId) {
    self.slots.push(id);
    arena.set_node_id(id, self.slots.len());
    self.sift_up(arena, id);
  }

  /// Move a record toward the root while its parent has a smaller key.
  pub fn sift_up<A: HeapArena>(&mut self, arena: &mut A, id: RecordId) {
    let mut node = arena.node_id(id);
    if !self.holds(id, node) {
      return;
    }
    let key = arena.key(id);

    while node > 1 {
      let parent_node = node >> 1;
      let parent = self.slots[parent_node - 1];
      if arena.key(parent) >= key {
        break;
      }
      self.swap(arena, node, parent_node);
      node = parent_node;
    }
  }

  /// Move a record toward the leaves while a child has a larger key.
  pub fn sift_down<A: HeapArena>(&mut self, arena: &mut A, id: RecordId) {
    let mut node = arena.node_id(id);
    if !self.holds(id, node) {
      return;
    }
    let key = arena.key(id);
    let len = self.slots.len();

    loop {
      let left = node << 1;
      if left > len {
        break;
      }
      let right = left + 1;
      let mut child = left;
      if right <= len && arena.key(self.slots[right - 1]) > arena.key(self.slots[left - 1]) {
        child = right;
      }
      if arena.key(self.slots[child - 1]) <= key {
        break;
      }
      self.swap(arena, node, child);
      node = child;
    }
  }

  /// Remove a record from wherever it sits. Stale handles are ignored.
  pub fn remove<A: HeapArena>(&mut self, arena: &mut A, id: RecordId) -> bool {
    let node = arena.node_id(id);
    if !self.holds(id, node) {
      return false;
    }

    let Some(last) = self.slots.pop() else {
      return false;
    };
    arena.set_node_id(id, 0);
    if last == id {
      return true;
    }

    self.slots[node - 1] = last;
    arena.set_node_id(last, node);

    let parent_node = node >> 1;
    if parent_node >= 1 && arena.key(self.slots[parent_node - 1]) < arena.key(last) {
      self.sift_up(arena, last);
    } else {
      self.sift_down(arena, last);
    }
    true
  }

  /// Remove and return the root.
  pub fn extract<A: HeapArena>(&mut self, arena: &mut A) -> Option<RecordId> {
    let root = self.peek()?;
    self.remove(arena, root);
    Some(root)
  }

  /// Handles ordered from highest to lowest key, without disturbing the heap.
  pub fn ranked<A: HeapArena>(&self, arena: &A) -> Vec<RecordId> {
    let mut order = self.slots.clone();
    order.sort_by(|a, b| arena.key(*b).cmp(&arena.key(*a)));
    order
  }

  pub fn clear(&mut self) {
    self.slots.clear();
  }

  fn holds(&self, id: RecordId, node: usize) -> bool {
    node >= 1 && node <= self.slots.len() && self.slots[node - 1] == id
  }

  fn swap<A: HeapArena>(&mut self, arena: &mut A, a: usize, b: usize) {
    self.slots.swap(a - 1, b - 1);
    arena.set_node_id(self.slots[a - 1], a);
    arena.set_node_id(self.slots[b - 1], b);
  }
}
