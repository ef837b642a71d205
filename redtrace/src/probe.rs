// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Probes and providers
//!
//! Probes are named `provider:module:function:name`. The [`ProbeTable`]
//! owns every probe of a session; everything else holds `Rc` handles to
//! them. Providers create their probes through the [`ProbeRegistry`] seam
//! and generate per-probe trampolines through [`ProviderOps`].

use std::fmt;
use std::rc::Rc;

use bpf_asm::IrList;
use tracing::debug;

use crate::error::{Error, Result};

pub type ProbeId = u32;

/// Interface stability levels, least to most stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stability {
    Internal,
    Private,
    Obsolete,
    External,
    Unstable,
    Evolving,
    Stable,
    Standard,
}

/// Architectural dependency classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DependencyClass {
    Unknown,
    Cpu,
    Platform,
    Group,
    Isa,
    Common,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub name: Stability,
    pub data: Stability,
    pub class: DependencyClass,
}

impl Attribute {
    pub const fn new(name: Stability, data: Stability, class: DependencyClass) -> Attribute {
        Attribute { name, data, class }
    }
}

/// Stability attributes of each part of a provider's probe descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderAttributes {
    pub provider: Attribute,
    pub module: Attribute,
    pub function: Attribute,
    pub name: Attribute,
    pub args: Attribute,
}

/// BPF program types a provider's trampolines are loaded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgType {
    Kprobe,
    Tracepoint,
    PerfEvent,
}

/// Kernel-visible identity of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub id: ProbeId,
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

impl fmt::Display for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.provider, self.module, self.function, self.name
        )
    }
}

/// Hooks a provider implements.
pub trait ProviderOps {
    fn name(&self) -> &'static str;

    fn prog_type(&self) -> ProgType;

    /// Registers the provider's probes. Returns how many were registered,
    /// with the error that stopped registration early, if any.
    fn populate(
        &self,
        provider: &Rc<Provider>,
        registry: &mut dyn ProbeRegistry,
    ) -> (usize, Option<Error>);

    /// Appends the trampoline for one of the provider's probes to `ir`.
    fn trampoline(&self, ir: &mut IrList, has_predicate: bool);
}

pub struct Provider {
    pub name: String,
    pub attr: ProviderAttributes,
    pub ops: &'static dyn ProviderOps,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("attr", &self.attr)
            .finish()
    }
}

/// Where providers put their probes.
pub trait ProbeRegistry {
    fn insert(
        &mut self,
        provider: &Rc<Provider>,
        module: &str,
        function: &str,
        name: &str,
    ) -> Result<Rc<ProbeDescriptor>>;
}

#[derive(Debug, Default)]
pub struct ProbeTable {
    providers: Vec<Rc<Provider>>,
    probes: Vec<(Rc<ProbeDescriptor>, Rc<Provider>)>,
}

impl ProbeTable {
    pub fn new() -> ProbeTable {
        ProbeTable::default()
    }

    pub fn add_provider(
        &mut self,
        ops: &'static dyn ProviderOps,
        attr: ProviderAttributes,
    ) -> Result<Rc<Provider>> {
        if let Some(prv) = self.provider(ops.name()) {
            return Ok(prv);
        }
        self.providers.try_reserve(1)?;
        let prv = Rc::new(Provider {
            name: ops.name().to_string(),
            attr,
            ops,
        });
        self.providers.push(Rc::clone(&prv));
        Ok(prv)
    }

    pub fn provider(&self, name: &str) -> Option<Rc<Provider>> {
        self.providers.iter().find(|p| p.name == name).cloned()
    }

    pub fn get(&self, id: ProbeId) -> Option<&Rc<ProbeDescriptor>> {
        self.probes.get(id as usize).map(|(p, _)| p)
    }

    pub fn provider_of(&self, id: ProbeId) -> Option<&Rc<Provider>> {
        self.probes.get(id as usize).map(|(_, prv)| prv)
    }

    pub fn lookup(
        &self,
        provider: &str,
        module: &str,
        function: &str,
        name: &str,
    ) -> Option<&Rc<ProbeDescriptor>> {
        self.probes.iter().map(|(p, _)| p).find(|p| {
            p.provider == provider
                && p.module == module
                && p.function == function
                && p.name == name
        })
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<ProbeDescriptor>> {
        self.probes.iter().map(|(p, _)| p)
    }

    pub fn clear(&mut self) {
        self.probes.clear();
        self.providers.clear();
    }
}

impl ProbeRegistry for ProbeTable {
    fn insert(
        &mut self,
        provider: &Rc<Provider>,
        module: &str,
        function: &str,
        name: &str,
    ) -> Result<Rc<ProbeDescriptor>> {
        if let Some(probe) = self.lookup(&provider.name, module, function, name) {
            return Ok(Rc::clone(probe));
        }

        self.probes.try_reserve(1)?;
        let probe = Rc::new(ProbeDescriptor {
            id: self.probes.len() as ProbeId,
            provider: provider.name.clone(),
            module: module.to_string(),
            function: function.to_string(),
            name: name.to_string(),
        });
        debug!("probe {} registered as id {}", probe, probe.id);
        self.probes.push((Rc::clone(&probe), Rc::clone(provider)));
        Ok(probe)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullProvider;

    impl ProviderOps for NullProvider {
        fn name(&self) -> &'static str {
            "null"
        }

        fn prog_type(&self) -> ProgType {
            ProgType::Tracepoint
        }

        fn populate(
            &self,
            _provider: &Rc<Provider>,
            _registry: &mut dyn ProbeRegistry,
        ) -> (usize, Option<Error>) {
            (0, None)
        }

        fn trampoline(&self, _ir: &mut IrList, _has_predicate: bool) {}
    }

    static NULL: NullProvider = NullProvider;

    const ATTR: Attribute = Attribute::new(
        Stability::Evolving,
        Stability::Evolving,
        DependencyClass::Isa,
    );

    const PATTR: ProviderAttributes = ProviderAttributes {
        provider: ATTR,
        module: ATTR,
        function: ATTR,
        name: ATTR,
        args: ATTR,
    };

    #[test]
    fn test_provider_is_created_once() {
        let mut table = ProbeTable::new();
        let a = table.add_provider(&NULL, PATTR).unwrap();
        let b = table.add_provider(&NULL, PATTR).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(table.provider("null").is_some());
        assert!(table.provider("dtrace").is_none());
    }

    #[test]
    fn test_probe_ids_and_lookup() {
        let mut table = ProbeTable::new();
        let prv = table.add_provider(&NULL, PATTR).unwrap();
        let open = table.insert(&prv, "vmlinux", "do_sys_open", "entry").unwrap();
        let close = table.insert(&prv, "vmlinux", "close_fd", "entry").unwrap();
        assert_eq!((open.id, close.id), (0, 1));
        assert_eq!(open.to_string(), "null:vmlinux:do_sys_open:entry");

        let again = table.insert(&prv, "vmlinux", "do_sys_open", "entry").unwrap();
        assert!(Rc::ptr_eq(&open, &again));
        assert_eq!(table.len(), 2);

        assert!(Rc::ptr_eq(table.get(1).unwrap(), &close));
        assert_eq!(table.provider_of(1).unwrap().name, "null");
        assert!(table.lookup("null", "vmlinux", "close_fd", "return").is_none());
        assert!(table.get(2).is_none());

        table.clear();
        assert!(table.is_empty());
        assert!(table.provider("null").is_none());
    }

    #[test]
    fn test_stability_order() {
        assert!(Stability::Private < Stability::Unstable);
        assert!(Stability::Stable < Stability::Standard);
        assert!(DependencyClass::Unknown < DependencyClass::Common);
    }
}
