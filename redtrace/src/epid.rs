// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Enabled probe ids.
//!
//! An enabled probe id names the binding of one compiled clause to one
//! probe. Records read back from the trace buffer start with that id, and
//! resolving it yields the layout to decode them with and the probe that
//! fired.

use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::probe::ProbeDescriptor;
use crate::record::DataDescriptor;
use crate::store::DescriptorStore;

pub type EnabledProbeId = u32;

/// One populated slot: both halves are always present together.
#[derive(Debug, Clone)]
pub struct EnabledProbe {
    pub data: Rc<DataDescriptor>,
    pub probe: Rc<ProbeDescriptor>,
}

#[derive(Debug)]
pub struct EnabledProbeCache {
    table: DescriptorStore<EnabledProbe>,
    next: EnabledProbeId,
}

impl Default for EnabledProbeCache {
    fn default() -> Self {
        EnabledProbeCache::new()
    }
}

impl EnabledProbeCache {
    pub fn new() -> EnabledProbeCache {
        EnabledProbeCache {
            table: DescriptorStore::new("enabled probe", 2),
            next: 0,
        }
    }

    /// Binds `data` to `probe` under the next free enabled probe id.
    pub fn register(
        &mut self,
        data: &Rc<DataDescriptor>,
        probe: &Rc<ProbeDescriptor>,
    ) -> Result<EnabledProbeId> {
        self.insert(self.next, data, probe)
    }

    /// Binds `data` to `probe` under `epid`. If `epid` is already bound,
    /// nothing changes and the existing binding stays.
    pub fn insert(
        &mut self,
        epid: EnabledProbeId,
        data: &Rc<DataDescriptor>,
        probe: &Rc<ProbeDescriptor>,
    ) -> Result<EnabledProbeId> {
        // The id space is exhausted once no id can follow this one.
        let next = epid.checked_add(1).ok_or(Error::NoMem)?;
        self.table.get_or_try_insert_with(epid as usize, || {
            debug!("enabled probe {} bound to {}", epid, probe);
            Ok(EnabledProbe {
                data: Rc::clone(data),
                probe: Rc::clone(probe),
            })
        })?;
        if next > self.next {
            self.next = next;
        }
        Ok(epid)
    }

    /// Looks up a registered enabled probe id.
    ///
    /// # Panics
    ///
    /// Panics if `epid` was never registered.
    pub fn resolve(&self, epid: EnabledProbeId) -> (&Rc<DataDescriptor>, &Rc<ProbeDescriptor>) {
        assert!(
            (epid as usize) < self.table.capacity(),
            "enabled probe id {} out of range",
            epid
        );
        match self.table.get(epid as usize) {
            Some(ep) => (&ep.data, &ep.probe),
            None => panic!("enabled probe id {} was never registered", epid),
        }
    }

    pub fn get(&self, epid: EnabledProbeId) -> Option<&EnabledProbe> {
        self.table.get(epid as usize)
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EnabledProbeId, &EnabledProbe)> {
        self.table.iter().map(|(i, ep)| (i as EnabledProbeId, ep))
    }

    /// Drops every binding, releasing this cache's share of each data
    /// descriptor.
    pub fn destroy(&mut self) {
        self.table.clear();
        self.next = 0;
    }
}
