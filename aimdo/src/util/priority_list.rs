/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::TryReserveError;

/// Stable reference to an entry of a [`PriorityList`].
///
/// Slots are reused once an entry is removed, so every handle carries the
/// generation of its slot. A handle of a removed entry never resolves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryHandle {
    index: u32,
    generation: u32,
}

impl EntryHandle {
    /// Packs this handle into a non zero integer
    pub(crate) fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        let index = (raw & u32::MAX as u64) as u32;
        if index == 0 {
            return None;
        }

        Some(Self {
            index: index - 1,
            generation: (raw >> 32) as u32,
        })
    }
}

struct Node<T> {
    value: T,

    /// neighbour with the next higher priority
    higher: Option<u32>,

    /// neighbour with the next lower priority
    lower: Option<u32>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Doubly linked list over an arena of slots, ordered from the highest
/// priority to the lowest priority.
///
/// Insertion, removal and moving an entry to either end are all O(1).
pub(crate) struct PriorityList<T> {
    slots: Vec<Slot<T>>,

    /// indices of slots that can be reused
    free_slots: Vec<u32>,

    highest: Option<u32>,
    lowest: Option<u32>,
    len: usize,
}

impl<T> PriorityList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            highest: None,
            lowest: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if the list is empty
    #[allow(unused)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value` with the highest priority.
    ///
    /// Fails without modifying the list if no host memory is left for the new slot.
    pub(crate) fn push_highest(&mut self, value: T) -> Result<EntryHandle, TryReserveError> {
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.try_reserve(1)?;
                // free slots must always be able to take every slot back
                self.free_slots.try_reserve(self.slots.len() + 1)?;

                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.node.is_none(), "reused slot should be empty");
        slot.node = Some(Node {
            value,
            higher: None,
            lower: None,
        });

        let handle = EntryHandle {
            index,
            generation: slot.generation,
        };

        self.link_highest(index);
        self.len += 1;
        Ok(handle)
    }

    /// Removes the entry and returns its value
    pub(crate) fn remove(&mut self, handle: EntryHandle) -> Option<T> {
        self.resolve(handle)?;
        self.unlink(handle.index);

        let slot = &mut self.slots[handle.index as usize];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        // capacity was reserved on insertion
        self.free_slots.push(handle.index);
        self.len -= 1;

        Some(node.value)
    }

    pub(crate) fn get(&self, handle: EntryHandle) -> Option<&T> {
        let index = self.resolve(handle)?;
        self.slots[index].node.as_ref().map(|node| &node.value)
    }

    pub(crate) fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut T> {
        let index = self.resolve(handle)?;
        self.slots[index].node.as_mut().map(|node| &mut node.value)
    }

    pub(crate) fn contains(&self, handle: EntryHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Moves the entry to the head of the list (highest priority)
    pub(crate) fn move_to_highest(&mut self, handle: EntryHandle) -> bool {
        if self.resolve(handle).is_none() {
            return false;
        }

        self.unlink(handle.index);
        self.link_highest(handle.index);
        true
    }

    /// Moves the entry to the tail of the list (lowest priority)
    pub(crate) fn move_to_lowest(&mut self, handle: EntryHandle) -> bool {
        if self.resolve(handle).is_none() {
            return false;
        }

        self.unlink(handle.index);
        self.link_lowest(handle.index);
        true
    }

    /// Entry with the lowest priority
    pub(crate) fn lowest(&self) -> Option<EntryHandle> {
        self.lowest.map(|index| self.handle_of(index))
    }

    /// Entry with the highest priority
    pub(crate) fn highest(&self) -> Option<EntryHandle> {
        self.highest.map(|index| self.handle_of(index))
    }

    /// Neighbour of `handle` with the next higher priority
    pub(crate) fn higher(&self, handle: EntryHandle) -> Option<EntryHandle> {
        let index = self.resolve(handle)?;
        let higher = self.slots[index].node.as_ref()?.higher?;
        Some(self.handle_of(higher))
    }

    /// Neighbour of `handle` with the next lower priority
    pub(crate) fn lower(&self, handle: EntryHandle) -> Option<EntryHandle> {
        let index = self.resolve(handle)?;
        let lower = self.slots[index].node.as_ref()?.lower?;
        Some(self.handle_of(lower))
    }

    /// Iterates from the highest priority to the lowest priority
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            curr: self.highest,
        }
    }

    fn resolve(&self, handle: EntryHandle) -> Option<usize> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation || slot.node.is_none() {
            return None;
        }
        Some(handle.index as usize)
    }

    fn handle_of(&self, index: u32) -> EntryHandle {
        EntryHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<T> {
        self.slots[index as usize]
            .node
            .as_mut()
            .expect("linked slot has to be occupied")
    }

    fn unlink(&mut self, index: u32) {
        let (higher, lower) = {
            let node = self.node_mut(index);
            let res = (node.higher, node.lower);
            node.higher = None;
            node.lower = None;
            res
        };

        match higher {
            Some(higher) => self.node_mut(higher).lower = lower,
            None => self.highest = lower,
        }
        match lower {
            Some(lower) => self.node_mut(lower).higher = higher,
            None => self.lowest = higher,
        }
    }

    fn link_highest(&mut self, index: u32) {
        let prev_highest = self.highest;
        {
            let node = self.node_mut(index);
            node.higher = None;
            node.lower = prev_highest;
        }

        match prev_highest {
            Some(prev) => self.node_mut(prev).higher = Some(index),
            None => self.lowest = Some(index),
        }
        self.highest = Some(index);
    }

    fn link_lowest(&mut self, index: u32) {
        let prev_lowest = self.lowest;
        {
            let node = self.node_mut(index);
            node.lower = None;
            node.higher = prev_lowest;
        }

        match prev_lowest {
            Some(prev) => self.node_mut(prev).lower = Some(index),
            None => self.highest = Some(index),
        }
        self.lowest = Some(index);
    }
}

/// An iterator over the list, from the highest to the lowest priority
pub(crate) struct Iter<'a, T> {
    list: &'a PriorityList<T>,
    curr: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (EntryHandle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.curr.take()?;
        let node = self.list.slots[index as usize].node.as_ref()?;
        self.curr = node.lower;

        Some((self.list.handle_of(index), &node.value))
    }
}
