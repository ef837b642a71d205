// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Aggregation descriptors
//!
//! Aggregation buffers only carry an aggregation id. The layout behind an
//! id is fetched from the kernel the first time the id is seen and kept for
//! the rest of the session.

use std::rc::Rc;

use tracing::{debug, warn};

use crate::epid::EnabledProbeId;
use crate::error::{Error, Result};
use crate::kernel::{AggDescRequest, KernelQuery};
use crate::record::RecordDescriptor;
use crate::store::DescriptorStore;
use crate::Options;

pub type AggregationId = u32;

/// Variable id reported for aggregations without a variable binding.
pub const AGGVARIDNONE: i64 = 0;

/// A compile-time aggregation variable, e.g. `@counts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggVar {
    pub name: String,
    pub id: u32,
}

/// Aggregation variables known to the compiler, addressed by the
/// back-reference the kernel hands out in a record's `uarg`.
#[derive(Debug, Default)]
pub struct AggVarTable {
    vars: Vec<Rc<AggVar>>,
}

impl AggVarTable {
    pub fn new() -> AggVarTable {
        AggVarTable::default()
    }

    /// Registers a variable and returns its back-reference key (never 0).
    pub fn insert(&mut self, name: &str, id: u32) -> Result<u64> {
        self.vars.try_reserve(1)?;
        self.vars.push(Rc::new(AggVar {
            name: name.to_string(),
            id,
        }));
        Ok(self.vars.len() as u64)
    }

    pub fn get(&self, uarg: u64) -> Option<&Rc<AggVar>> {
        if uarg == 0 {
            return None;
        }
        self.vars.get(uarg as usize - 1)
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationDescriptor {
    pub id: AggregationId,
    pub epid: EnabledProbeId,
    pub size: u32,
    pub flags: i32,
    pub recs: Box<[RecordDescriptor]>,
    /// Source-level variable, absent for anonymous enablings.
    pub var: Option<Rc<AggVar>>,
}

impl AggregationDescriptor {
    pub fn name(&self) -> Option<&str> {
        self.var.as_ref().map(|v| v.name.as_str())
    }

    pub fn varid(&self) -> i64 {
        self.var.as_ref().map(|v| v.id as i64).unwrap_or(AGGVARIDNONE)
    }

    pub fn records(&self) -> &[RecordDescriptor] {
        &self.recs
    }
}

#[derive(Debug)]
pub struct AggregationCache {
    table: DescriptorStore<AggregationDescriptor>,
}

impl Default for AggregationCache {
    fn default() -> Self {
        AggregationCache::new()
    }
}

impl AggregationCache {
    pub fn new() -> AggregationCache {
        AggregationCache {
            table: DescriptorStore::new("aggregation", 1),
        }
    }

    /// Resolves `id`, asking the kernel on first use.
    ///
    /// A failed fetch is not remembered: the next call for the same id asks
    /// the kernel again.
    pub fn resolve<K>(
        &mut self,
        id: AggregationId,
        kernel: &mut K,
        vars: &AggVarTable,
        opts: &Options,
    ) -> Result<&AggregationDescriptor>
    where
        K: KernelQuery + ?Sized,
    {
        self.table.get_or_try_insert_with(id as usize, || {
            let req = fetch(id, kernel)?;
            let var = bind_var(&req, vars, opts);
            debug!(
                "aggregation {} cached with {} records ({})",
                id,
                req.recs.len(),
                var.as_ref().map(|v| v.name.as_str()).unwrap_or("anonymous")
            );
            Ok(AggregationDescriptor {
                id: req.id,
                epid: req.epid,
                size: req.size,
                flags: req.flags,
                recs: req.recs.into_boxed_slice(),
                var,
            })
        })
    }

    pub fn get(&self, id: AggregationId) -> Option<&AggregationDescriptor> {
        self.table.get(id as usize)
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

    pub fn destroy(&mut self) {
        self.table.clear();
    }
}

/// Asks for a single record first and retries once, sized exactly, when
/// the kernel reports more.
fn fetch<K>(id: AggregationId, kernel: &mut K) -> Result<AggDescRequest>
where
    K: KernelQuery + ?Sized,
{
    let mut req = AggDescRequest::new(id, 1)?;
    query(kernel, &mut req)?;
    if req.is_complete() {
        return Ok(req);
    }

    let nrecs = req.nrecs as usize;
    debug!("aggregation {} has {} records, querying again", id, nrecs);
    let mut recs = Vec::new();
    recs.try_reserve_exact(nrecs)?;
    recs.resize(nrecs, RecordDescriptor::default());
    req.recs = recs;
    query(kernel, &mut req)?;

    if !req.is_complete() {
        warn!(
            "aggregation {} grew from {} to {} records between queries",
            id, nrecs, req.nrecs
        );
        return Err(Error::Query(libc::EAGAIN));
    }
    Ok(req)
}

fn query<K>(kernel: &mut K, req: &mut AggDescRequest) -> Result<()>
where
    K: KernelQuery + ?Sized,
{
    kernel.aggregation_desc(req).map_err(|e| {
        warn!("aggregation {} description query failed: {}", req.id, e);
        Error::from(e)
    })
}

fn bind_var(req: &AggDescRequest, vars: &AggVarTable, opts: &Options) -> Option<Rc<AggVar>> {
    if opts.grab_anon {
        return None;
    }
    let uarg = req.recs.first().map(|r| r.uarg).unwrap_or(0);
    if uarg == 0 {
        return None;
    }
    let var = vars.get(uarg).cloned();
    if var.is_none() {
        debug!(
            "aggregation {} refers to unknown variable key {}",
            req.id, uarg
        );
    }
    var
}
