// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sparse tables keyed by small dense integer ids.
//!
//! A [`DescriptorStore`] starts out with no slots at all and grows by
//! doubling whenever an id beyond its current capacity shows up. Slots are
//! filled at most once and stay filled until the whole store is cleared.

use tracing::debug;

use crate::error::Result;

#[derive(Debug)]
pub struct DescriptorStore<T> {
    slots: Vec<Option<T>>,
    min_capacity: usize,
    name: &'static str,
}

impl<T> DescriptorStore<T> {
    /// Creates an empty store. The first growth allocates `min_capacity`
    /// slots, every following one doubles the capacity.
    pub fn new(name: &'static str, min_capacity: usize) -> DescriptorStore<T> {
        assert!(min_capacity > 0);
        DescriptorStore {
            slots: Vec::new(),
            min_capacity,
            name,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Makes sure `index` is a valid slot.
    ///
    /// The new table is allocated before the old contents move over, so an
    /// allocation failure leaves the store exactly as it was.
    pub fn grow_to(&mut self, index: usize) -> Result<()> {
        let old = self.slots.len();
        if index < old {
            return Ok(());
        }

        let mut new = old;
        while index >= new {
            new = if new == 0 { self.min_capacity } else { new << 1 };
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(new)?;
        slots.extend(self.slots.drain(..));
        slots.resize_with(new, || None);
        self.slots = slots;

        debug!("{} table grown from {} to {} slots", self.name, old, new);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Returns the value at `index`, creating it with `create` if the slot is
    /// empty. The store grows first if needed. When `create` fails the slot
    /// stays empty.
    pub fn get_or_try_insert_with<F>(&mut self, index: usize, create: F) -> Result<&T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.grow_to(index)?;
        let slot = &mut self.slots[index];
        let value = match slot.take() {
            Some(value) => value,
            None => create()?,
        };
        Ok(&*slot.insert(value))
    }

    /// Iterates over populated slots as `(index, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }

    /// Drops every populated value and returns the store to its initial,
    /// capacity-less state.
    pub fn clear(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        debug!(
            "{} table released ({} of {} slots populated)",
            self.name,
            self.len(),
            self.slots.len()
        );
        self.slots = Vec::new();
    }
}
