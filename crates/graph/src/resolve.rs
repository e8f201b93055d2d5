//! Host readback of committed outputs.
//!
//! After every tick the executor snapshots each registered value's bytes
//! into an immutable [ValueTable] and publishes it. A [Resolver] is pinned
//! to the table that was current when it was handed out; once a newer tick
//! supersedes that table, the resolver fails with a disposed error instead
//! of returning stale data.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use util::collections::Map;

use crate::error::{Error, Result};
use crate::topology::{Node, PortId, Topology};

/// An external, lifetime-tracked handle to a (node, output port) pair.
///
/// Valid from the tick after creation until released or until the target
/// node is destroyed; for the window already in flight when either happens,
/// it still resolves, and fails deterministically afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphValue {
    pub(crate) id: u64,
    /// Epoch of the last completed tick when the value was created; tables
    /// at or before this epoch cannot contain the value yet.
    pub(crate) born: u64,
}

pub(crate) struct ValueEntry {
    pub node: Node,
    pub port: PortId,
    pub released: bool,
}

#[derive(Default)]
pub(crate) struct ValueRegistry {
    entries: Map<u64, ValueEntry>,
    next: u64,
}

impl ValueRegistry {
    pub fn create(&mut self, node: Node, port: PortId, born: u64) -> GraphValue {
        let id = self.next;
        self.next += 1;
        self.entries.insert(
            id,
            ValueEntry {
                node,
                port,
                released: false,
            },
        );
        GraphValue { id, born }
    }

    pub fn release(&mut self, value: GraphValue) -> Result<()> {
        match self.entries.get_mut(&value.id) {
            Some(entry) if !entry.released => {
                entry.released = true;
                Ok(())
            }
            _ => Err(Error::Disposed),
        }
    }

    /// Drop released entries and entries whose target node no longer exists.
    /// Runs during commit, so the table from the in-flight window still
    /// carries the dropped values for one more tick.
    pub fn prune(&mut self, live: &Topology) {
        self.entries
            .retain(|_, entry| !entry.released && live.contains(entry.node));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &ValueEntry)> {
        self.entries.iter()
    }
}

/// The per-tick snapshot of every registered value. Public only because the
/// self-referential [ValueView] owns one; nothing outside the crate can
/// construct or inspect it.
pub struct ValueTable {
    pub(crate) epoch: u64,
    pub(crate) entries: Map<u64, Box<[u8]>>,
}

/// Resolves [GraphValue]s against one tick's committed snapshot.
pub struct Resolver {
    table: Arc<ValueTable>,
    latest: Arc<ArcSwapOption<ValueTable>>,
}

impl Resolver {
    pub(crate) fn new(table: Arc<ValueTable>, latest: Arc<ArcSwapOption<ValueTable>>) -> Self {
        Self { table, latest }
    }

    /// The execution epoch this resolver is pinned to.
    pub fn epoch(&self) -> u64 {
        self.table.epoch
    }

    /// Resolve a value to a read-only view of its committed bytes.
    pub fn resolve(&self, value: &GraphValue) -> Result<ValueView> {
        let current = self.latest.load();
        match current.as_ref() {
            Some(table) if table.epoch == self.table.epoch => {}
            // A newer tick superseded this resolver's snapshot.
            _ => return Err(Error::Disposed),
        }
        if !self.table.entries.contains_key(&value.id) {
            return Err(if self.table.epoch <= value.born {
                Error::NotYetValid
            } else {
                Error::Disposed
            });
        }
        let id = value.id;
        Ok(ValueViewBuilder {
            table: self.table.clone(),
            bytes_builder: |table| &table.entries[&id][..],
        }
        .build())
    }
}

/// A read-only view of one resolved value, keeping its snapshot alive.
#[ouroboros::self_referencing]
pub struct ValueView {
    table: Arc<ValueTable>,
    #[borrows(table)]
    bytes: &'this [u8],
}

impl ValueView {
    pub fn bytes(&self) -> &[u8] {
        self.borrow_bytes()
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Interpret the whole view as a single `T`.
    pub fn read<T: Copy>(&self) -> Result<T> {
        let bytes = self.bytes();
        if bytes.len() != size_of::<T>() {
            return Err(Error::KindMismatch);
        }
        Ok(unsafe { bytes.as_ptr().cast::<T>().read_unaligned() })
    }

    /// Read element `index` of a buffer-valued view.
    pub fn read_at<T: Copy>(&self, index: usize) -> Result<T> {
        let bytes = self.bytes();
        let offset = index
            .checked_mul(size_of::<T>())
            .ok_or(Error::PortIndexOutOfRange)?;
        if offset + size_of::<T>() > bytes.len() {
            return Err(Error::PortIndexOutOfRange);
        }
        Ok(unsafe { bytes.as_ptr().add(offset).cast::<T>().read_unaligned() })
    }

    /// Number of `T`-sized elements in the view.
    pub fn count<T>(&self) -> usize {
        self.bytes().len() / size_of::<T>().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(epoch: u64, entries: &[(u64, &[u8])]) -> Arc<ValueTable> {
        let entries = entries
            .iter()
            .map(|(id, bytes)| (*id, bytes.to_vec().into_boxed_slice()))
            .collect();
        Arc::new(ValueTable { epoch, entries })
    }

    #[test]
    fn superseded_resolvers_are_disposed() {
        let latest: Arc<ArcSwapOption<ValueTable>> = Arc::new(ArcSwapOption::from(None));
        let first = table(1, &[(0, &7u64.to_ne_bytes())]);
        latest.store(Some(first.clone()));

        let resolver = Resolver::new(first, latest.clone());
        let value = GraphValue { id: 0, born: 0 };
        assert_eq!(resolver.resolve(&value).unwrap().read::<u64>(), Ok(7));

        latest.store(Some(table(2, &[(0, &9u64.to_ne_bytes())])));
        assert_eq!(resolver.resolve(&value).err(), Some(Error::Disposed));
    }

    #[test]
    fn missing_entries_distinguish_young_from_dead() {
        let latest: Arc<ArcSwapOption<ValueTable>> = Arc::new(ArcSwapOption::from(None));
        let current = table(3, &[]);
        latest.store(Some(current.clone()));
        let resolver = Resolver::new(current, latest);

        // Created after epoch 3 completed: not yet produced.
        let young = GraphValue { id: 1, born: 3 };
        assert_eq!(resolver.resolve(&young).err(), Some(Error::NotYetValid));

        // Created long ago and gone from the table: disposed.
        let dead = GraphValue { id: 2, born: 1 };
        assert_eq!(resolver.resolve(&dead).err(), Some(Error::Disposed));
    }
}
