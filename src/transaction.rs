use crate::interval_set::IntervalSet;

/// Whether a delta allocates or frees the blocks it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Set,
    Clear,
}

/// One allocation/free delta recorded on a transaction. `SET` means "to be
/// allocated" on commit; `CLEAR` means "to be freed" on commit.
#[derive(Debug, Clone)]
pub struct RbmAllocDelta {
    pub alloc_blk_ids: IntervalSet,
    pub op: DeltaOp,
}

/// Caller-owned object accumulating allocation/free deltas for a single
/// round of allocator work. Deltas are mutated until either
/// `complete_allocation` persists them to the on-disk bitmap or
/// `abort_allocation` drops them; a `Transaction` never touches the device
/// on its own.
#[derive(Debug, Default)]
pub struct Transaction {
    deltas: Vec<RbmAllocDelta>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction { deltas: Vec::new() }
    }

    pub fn deltas(&self) -> &[RbmAllocDelta] {
        &self.deltas
    }

    pub(crate) fn push_delta(&mut self, op: DeltaOp, ids: IntervalSet) {
        self.deltas.push(RbmAllocDelta {
            alloc_blk_ids: ids,
            op,
        });
    }

    /// Union of every pending `SET` delta's block ids, used by
    /// `find_free_block` so two back-to-back `alloc_extent` calls on the
    /// same transaction never hand out overlapping blocks.
    pub(crate) fn pending_set_ids(&self) -> IntervalSet {
        let mut set = IntervalSet::new();
        for delta in &self.deltas {
            if delta.op == DeltaOp::Set {
                for (start, len) in delta.alloc_blk_ids.iter() {
                    set.insert(start, len);
                }
            }
        }
        set
    }

    /// Discard all pending deltas without touching the device.
    pub fn abort(&mut self) {
        self.deltas.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_set_ids_unions_across_deltas() {
        let mut txn = Transaction::new();
        let mut first = IntervalSet::new();
        first.insert(0, 3);
        txn.push_delta(DeltaOp::Set, first);
        let mut second = IntervalSet::new();
        second.insert(10, 2);
        txn.push_delta(DeltaOp::Set, second);

        let pending = txn.pending_set_ids();
        assert!(pending.intersects(1));
        assert!(pending.intersects(11));
        assert!(!pending.intersects(5));
    }

    #[test]
    fn pending_set_ids_ignores_clear_deltas() {
        let mut txn = Transaction::new();
        let mut ids = IntervalSet::new();
        ids.insert(0, 3);
        txn.push_delta(DeltaOp::Clear, ids);
        assert!(txn.pending_set_ids().is_empty());
    }

    #[test]
    fn abort_clears_all_deltas() {
        let mut txn = Transaction::new();
        let mut ids = IntervalSet::new();
        ids.insert(0, 3);
        txn.push_delta(DeltaOp::Set, ids);
        assert!(!txn.is_empty());
        txn.abort();
        assert!(txn.is_empty());
    }
}
