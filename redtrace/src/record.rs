// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Output record layouts
//!
//! Every compiled clause writes a sequence of records into the trace buffer.
//! While the clause is compiled, a [`RecordBuilder`] collects one
//! [`RecordDescriptor`] per record; finalizing the builder produces the
//! clause's [`DataDescriptor`], which is shared between the statement that
//! produced it and every enabled probe it gets bound to.

use std::rc::Rc;

use tracing::debug;

use crate::error::Result;

const ACT_PROC: u16 = 0x0100;
const ACT_KERNEL: u16 = 0x0500;
const ACT_AGGREGATION: u16 = 0x0700;

/// Aggregating functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggKind {
    Count,
    Max,
    Min,
    Avg,
    Sum,
    Stddev,
    Quantize,
    LQuantize,
    LLQuantize,
}

impl AggKind {
    const ALL: [AggKind; 9] = [
        AggKind::Count,
        AggKind::Max,
        AggKind::Min,
        AggKind::Avg,
        AggKind::Sum,
        AggKind::Stddev,
        AggKind::Quantize,
        AggKind::LQuantize,
        AggKind::LLQuantize,
    ];

    fn offset(self) -> u16 {
        match self {
            AggKind::Count => 1,
            AggKind::Max => 2,
            AggKind::Min => 3,
            AggKind::Avg => 4,
            AggKind::Sum => 5,
            AggKind::Stddev => 6,
            AggKind::Quantize => 7,
            AggKind::LQuantize => 8,
            AggKind::LLQuantize => 9,
        }
    }
}

/// What a record holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ActionKind {
    #[default]
    None,
    DifExpr,
    Exit,
    Printf,
    Printa,
    LibAct,
    TraceMem,
    UStack,
    Stack,
    Aggregation(AggKind),
    Other(u16),
}

impl ActionKind {
    pub fn from_raw(raw: u16) -> ActionKind {
        match raw {
            0 => ActionKind::None,
            1 => ActionKind::DifExpr,
            2 => ActionKind::Exit,
            3 => ActionKind::Printf,
            4 => ActionKind::Printa,
            5 => ActionKind::LibAct,
            6 => ActionKind::TraceMem,
            r if r == ACT_PROC + 1 => ActionKind::UStack,
            r if r == ACT_KERNEL + 1 => ActionKind::Stack,
            r => AggKind::ALL
                .iter()
                .find(|k| ACT_AGGREGATION + k.offset() == r)
                .map(|k| ActionKind::Aggregation(*k))
                .unwrap_or(ActionKind::Other(r)),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ActionKind::None => 0,
            ActionKind::DifExpr => 1,
            ActionKind::Exit => 2,
            ActionKind::Printf => 3,
            ActionKind::Printa => 4,
            ActionKind::LibAct => 5,
            ActionKind::TraceMem => 6,
            ActionKind::UStack => ACT_PROC + 1,
            ActionKind::Stack => ACT_KERNEL + 1,
            ActionKind::Aggregation(k) => ACT_AGGREGATION + k.offset(),
            ActionKind::Other(r) => r,
        }
    }

    /// Actions whose output is rendered through a format.
    pub fn is_printf_like(self) -> bool {
        matches!(self, ActionKind::Printf | ActionKind::Printa)
    }

    pub fn is_aggregation(self) -> bool {
        matches!(self, ActionKind::Aggregation(_))
    }
}

/// Layout of one output record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordDescriptor {
    pub action: ActionKind,
    pub size: u32,
    pub offset: u32,
    pub alignment: u16,
    /// 1-based format id, 0 when the record has no format.
    pub format: u16,
    pub arg: u64,
    /// Back-reference filled in by the kernel side, 0 when absent.
    pub uarg: u64,
}

/// The record layout of one compiled clause.
///
/// Published descriptors are shared through `Rc`; the strong count is the
/// number of holders (the compiled statement plus one per enabled probe).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DataDescriptor {
    recs: Box<[RecordDescriptor]>,
}

impl DataDescriptor {
    pub fn records(&self) -> &[RecordDescriptor] {
        &self.recs
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    /// Total number of bytes a clause with this layout emits.
    pub fn size(&self) -> u32 {
        self.recs
            .iter()
            .map(|r| r.offset.saturating_add(r.size))
            .max()
            .unwrap_or(0)
    }
}

/// Compilation context for the records of a single clause.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    recs: Vec<RecordDescriptor>,
    maxrecs: usize,
}

impl RecordBuilder {
    pub fn new() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    /// Number of records space has been allocated for.
    pub fn capacity(&self) -> usize {
        self.maxrecs
    }

    pub fn records(&self) -> &[RecordDescriptor] {
        &self.recs
    }

    /// Appends a record. On allocation failure nothing changes.
    pub fn append(
        &mut self,
        action: ActionKind,
        size: u32,
        offset: u32,
        alignment: u16,
        format: u16,
        arg: u64,
    ) -> Result<()> {
        let cnt = self.recs.len() + 1;
        if cnt > self.maxrecs {
            let nmax = (self.maxrecs << 1).max(cnt);
            let mut nrecs = Vec::new();
            nrecs.try_reserve_exact(nmax)?;
            nrecs.extend_from_slice(&self.recs);
            self.recs = nrecs;
            self.maxrecs = nmax;
        }

        self.recs.push(RecordDescriptor {
            action,
            size,
            offset,
            alignment,
            format,
            arg,
            uarg: 0,
        });
        Ok(())
    }

    /// Publishes the collected records as a data descriptor.
    ///
    /// Over-allocated record storage is copied into an exact-fit buffer
    /// first. The builder is consumed so it cannot be finalized twice.
    pub fn finalize(mut self) -> Result<Rc<DataDescriptor>> {
        let nrecs = self.recs.len();
        if nrecs < self.maxrecs {
            let mut exact = Vec::new();
            exact.try_reserve_exact(nrecs)?;
            exact.extend_from_slice(&self.recs);
            self.recs = exact;
            self.maxrecs = nrecs;
        }

        debug!("data descriptor finalized with {} records", nrecs);
        Ok(Rc::new(DataDescriptor {
            recs: self.recs.into_boxed_slice(),
        }))
    }
}
