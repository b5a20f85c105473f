//! Append-only storage addressed by typed handles.
//!
//! A [`Function`](crate::Function) keeps its values and instructions in two
//! [`Arena`]s. The [`TypeContext`](crate::TypeContext) interns types in a
//! [`UniqueArena`], so two structurally equal types always get the same
//! handle and type equality reduces to handle equality.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::{Index, IndexMut};

/// Typed index into an [`Arena`] or a [`UniqueArena`].
///
/// Slots are never reused: an instruction erased from its region keeps its
/// storage, so a handle stays valid for the lifetime of its arena.
/// `Option<Handle<T>>` has the size of a `u32`.
pub struct Handle<T> {
    slot: NonZeroU32,
    marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn from_position(position: usize) -> Self {
        let slot = u32::try_from(position + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or_else(|| panic!("more than u32::MAX - 1 entries in one arena"));
        Self {
            slot,
            marker: PhantomData,
        }
    }

    /// Zero-based position in the owning arena.
    pub fn index(self) -> usize {
        self.slot.get() as usize - 1
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.slot.cmp(&other.slot)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index())
    }
}

fn enumerate<T>(items: &[T]) -> impl Iterator<Item = (Handle<T>, &T)> {
    items
        .iter()
        .enumerate()
        .map(|(position, item)| (Handle::from_position(position), item))
}

/// Append-only arena.
#[derive(Clone, Debug)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Stores `item` and returns its handle.
    pub fn append(&mut self, item: T) -> Handle<T> {
        let handle = Handle::from_position(self.items.len());
        self.items.push(item);
        handle
    }

    /// Returns the item behind `handle`, or `None` for a foreign handle.
    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index())
    }

    pub fn try_get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.items.get_mut(handle.index())
    }

    /// Items in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        enumerate(&self.items)
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        &self.items[handle.index()]
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        &mut self.items[handle.index()]
    }
}

/// Interning arena: equal items share one handle. Items are immutable once
/// stored.
#[derive(Clone, Debug)]
pub struct UniqueArena<T> {
    items: Vec<T>,
    interned: HashMap<T, Handle<T>>,
}

impl<T> Default for UniqueArena<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            interned: HashMap::new(),
        }
    }
}

impl<T: Clone + Hash + Eq> UniqueArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Interns `item`.
    pub fn insert(&mut self, item: T) -> Handle<T> {
        if let Some(&handle) = self.interned.get(&item) {
            return handle;
        }
        let handle = Handle::from_position(self.items.len());
        self.interned.insert(item.clone(), handle);
        self.items.push(item);
        handle
    }

    /// Handle of `item` if it was interned before.
    pub fn lookup(&self, item: &T) -> Option<Handle<T>> {
        self.interned.get(item).copied()
    }

    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index())
    }

    /// Items in interning order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        enumerate(&self.items)
    }
}

impl<T> Index<Handle<T>> for UniqueArena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        &self.items[handle.index()]
    }
}
