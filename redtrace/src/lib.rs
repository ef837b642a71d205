// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # RedTrace
//!
//! Runtime metadata for a BPF based dynamic tracer. A [`Session`] owns
//!  * the probes registered by providers,
//!  * the enabled probe ids binding compiled clauses to probes,
//!  * the aggregation descriptors fetched lazily from the kernel,
//!  * the format objects used to render `printf`/`printa` output,
//!
//! and generates the trampolines that turn a raw probe context into a call
//! of a compiled clause.
//!
//! ```no_run
//! use redtrace::{ActionKind, RecordBuilder, Options, Session};
//!
//! let mut session = Session::open(Options::default()).unwrap();
//! session.populate();
//! let begin = session.lookup_probe("dtrace", "", "", "BEGIN").unwrap().id;
//!
//! let mut recs = RecordBuilder::new();
//! recs.append(ActionKind::DifExpr, 8, 0, 8, 0, 0).unwrap();
//! let ddesc = recs.finalize().unwrap();
//!
//! let epid = session.epid_add(&ddesc, begin).unwrap();
//! let trampoline = session.trampoline(begin, false);
//! println!("{}", trampoline);
//!
//! let (data, probe) = session.epid_lookup(epid);
//! assert_eq!(data.len(), 1);
//! assert_eq!(probe.name, "BEGIN");
//! ```
#![deny(clippy::all)]

pub mod agg;
pub mod context;
pub mod epid;
mod error;
pub mod format;
pub mod kernel;
pub mod probe;
pub mod provider;
pub mod record;
pub mod store;

use std::rc::Rc;

use bpf_asm::IrList;
use tracing::{debug, warn};

pub use crate::agg::{AggVar, AggregationCache, AggregationDescriptor, AggregationId};
pub use crate::epid::{EnabledProbeCache, EnabledProbeId};
pub use crate::error::{Error, Result, EDT_COMPILER, EDT_NOMEM};
pub use crate::format::{Format, FormatId, FormatKind, FormatTable};
pub use crate::kernel::{AggDescRequest, KernelQuery};
pub use crate::probe::{ProbeDescriptor, ProbeId, ProbeTable};
pub use crate::record::{ActionKind, AggKind, DataDescriptor, RecordBuilder, RecordDescriptor};

use crate::agg::AggVarTable;
use crate::probe::{ProbeRegistry, Provider};

/// Session options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Consume an anonymous enabling left behind in the kernel. Its
    /// aggregations cannot be mapped back to source-level variables.
    pub grab_anon: bool,
}

/// One tracing session.
pub struct Session {
    opts: Options,
    kernel: Box<dyn KernelQuery>,
    probes: ProbeTable,
    epids: EnabledProbeCache,
    aggs: AggregationCache,
    aggvars: AggVarTable,
    formats: FormatTable,
    errno: Option<Error>,
}

/// Stores the error of a failed operation as the session's error state.
fn record<T>(errno: &mut Option<Error>, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        *errno = Some(e.clone());
    }
    result
}

/// Runs a provider's probe registration against `registry`, keeping the
/// error that cut it short as the session's error state.
fn populate_provider(
    errno: &mut Option<Error>,
    prv: &Rc<Provider>,
    registry: &mut dyn ProbeRegistry,
) -> usize {
    let (cnt, err) = prv.ops.populate(prv, registry);
    if let Some(e) = err {
        *errno = Some(e);
    }
    cnt
}

impl Session {
    pub fn new(kernel: Box<dyn KernelQuery>, opts: Options) -> Session {
        Session {
            opts,
            kernel,
            probes: ProbeTable::new(),
            epids: EnabledProbeCache::new(),
            aggs: AggregationCache::new(),
            aggvars: AggVarTable::new(),
            formats: FormatTable::new(),
            errno: None,
        }
    }

    /// Opens a session on the DTrace control device.
    #[cfg(feature = "device")]
    pub fn open(opts: Options) -> Result<Session> {
        let device = kernel::DtraceDevice::open()?;
        Ok(Session::new(Box::new(device), opts))
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// The error of the last failed operation.
    pub fn errno(&self) -> Option<&Error> {
        self.errno.as_ref()
    }

    /// Registers the probes of every built-in provider and returns how many
    /// were registered.
    pub fn populate(&mut self) -> usize {
        let mut n = 0;
        for (ops, attr) in provider::builtin().iter() {
            let prv = match record(&mut self.errno, self.probes.add_provider(*ops, *attr)) {
                Ok(prv) => prv,
                Err(e) => {
                    warn!("provider {} not created: {}", ops.name(), e);
                    continue;
                }
            };
            let cnt = populate_provider(&mut self.errno, &prv, &mut self.probes);
            debug!("provider {} registered {} probes", prv.name, cnt);
            n += cnt;
        }
        n
    }

    pub fn probe(&self, id: ProbeId) -> Option<&Rc<ProbeDescriptor>> {
        self.probes.get(id)
    }

    pub fn lookup_probe(
        &self,
        provider: &str,
        module: &str,
        function: &str,
        name: &str,
    ) -> Option<&Rc<ProbeDescriptor>> {
        self.probes.lookup(provider, module, function, name)
    }

    pub fn probes(&self) -> &ProbeTable {
        &self.probes
    }

    /// Generates the trampoline for probe `id` with its provider.
    ///
    /// # Panics
    ///
    /// Panics if no probe with that id exists.
    pub fn trampoline(&self, id: ProbeId, has_predicate: bool) -> IrList {
        let prv = match self.probes.provider_of(id) {
            Some(prv) => prv,
            None => panic!("probe id {} does not exist", id),
        };
        let mut ir = IrList::new();
        prv.ops.trampoline(&mut ir, has_predicate);
        debug!(
            "{:?} trampoline for probe {}: {} instructions",
            prv.ops.prog_type(),
            id,
            ir.len()
        );
        ir
    }

    /// Registers a compile-time aggregation variable; the returned key is
    /// what the kernel reports back in the `uarg` of the aggregation's
    /// first record.
    pub fn aggvar_add(&mut self, name: &str, varid: u32) -> Result<u64> {
        record(&mut self.errno, self.aggvars.insert(name, varid))
    }

    /// Binds a finalized data descriptor to probe `prid`.
    ///
    /// # Panics
    ///
    /// Panics if no probe with that id exists.
    pub fn epid_add(
        &mut self,
        ddesc: &Rc<DataDescriptor>,
        prid: ProbeId,
    ) -> Result<EnabledProbeId> {
        let probe = match self.probes.get(prid) {
            Some(probe) => Rc::clone(probe),
            None => panic!("probe id {} does not exist", prid),
        };
        record(&mut self.errno, self.epids.register(ddesc, &probe))
    }

    /// # Panics
    ///
    /// Panics if `epid` was never registered.
    pub fn epid_lookup(
        &self,
        epid: EnabledProbeId,
    ) -> (&Rc<DataDescriptor>, &Rc<ProbeDescriptor>) {
        self.epids.resolve(epid)
    }

    pub fn epids(&self) -> &EnabledProbeCache {
        &self.epids
    }

    pub fn aggid_lookup(&mut self, id: AggregationId) -> Result<&AggregationDescriptor> {
        record(
            &mut self.errno,
            self.aggs.resolve(id, &mut *self.kernel, &self.aggvars, &self.opts),
        )
    }

    pub fn format_add(
        &mut self,
        id: FormatId,
        kind: FormatKind,
        string: &str,
    ) -> Result<&Format> {
        record(&mut self.errno, self.formats.insert(id, kind, string))
    }

    pub fn format_lookup(&self, id: FormatId) -> Option<&Format> {
        self.formats.lookup(id)
    }

    /// Releases everything the session holds. Calling it again is a no-op.
    pub fn destroy(&mut self) {
        self.epids.destroy();
        self.aggs.destroy();
        self.formats.destroy();
        self.aggvars.clear();
        self.probes.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}
