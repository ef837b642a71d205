// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use tracing::debug;

use crate::error::{Error, Result};
use crate::record::ActionKind;
use crate::store::DescriptorStore;

/// 1-based format id. 0 means "no format".
pub type FormatId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Printf,
    Printa,
}

impl FormatKind {
    pub fn for_action(action: ActionKind) -> Option<FormatKind> {
        match action {
            ActionKind::Printf => Some(FormatKind::Printf),
            ActionKind::Printa => Some(FormatKind::Printa),
            _ => None,
        }
    }
}

/// A format string split into literal text and conversions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub kind: FormatKind,
    pub string: String,
    conversions: Vec<String>,
}

impl Format {
    pub fn new(kind: FormatKind, string: &str) -> Result<Format> {
        let mut conversions = vec![];
        let mut chars = string.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c != '%' {
                continue;
            }
            if let Some((_, '%')) = chars.peek() {
                chars.next();
                continue;
            }
            let mut end = None;
            for (i, c) in chars.by_ref() {
                if c.is_ascii_alphabetic() && !matches!(c, 'l' | 'h' | 'j' | 'z' | 't' | 'L') {
                    end = Some(i + c.len_utf8());
                    break;
                }
            }
            match end {
                Some(end) => conversions.push(string[start..end].to_string()),
                None => {
                    return Err(Error::Format(format!(
                        "unterminated conversion in \"{}\"",
                        string
                    )))
                }
            }
        }

        Ok(Format {
            kind,
            string: string.to_string(),
            conversions,
        })
    }

    /// Conversion specifications, e.g. `%d` or `%-8s`, in order.
    pub fn conversions(&self) -> &[String] {
        &self.conversions
    }
}

#[derive(Debug)]
pub struct FormatTable {
    table: DescriptorStore<Format>,
}

impl Default for FormatTable {
    fn default() -> Self {
        FormatTable::new()
    }
}

impl FormatTable {
    pub fn new() -> FormatTable {
        FormatTable {
            table: DescriptorStore::new("format", 1),
        }
    }

    /// Creates the format object for `id`. An id that already has one
    /// keeps it.
    pub fn insert(&mut self, id: FormatId, kind: FormatKind, string: &str) -> Result<&Format> {
        assert!(id != 0, "format id 0 is reserved");
        self.table.get_or_try_insert_with(id as usize - 1, || {
            let fmt = Format::new(kind, string)?;
            debug!("format {} created: {:?}", id, string);
            Ok(fmt)
        })
    }

    /// Absent for id 0, ids past the end of the table and unpopulated slots.
    pub fn lookup(&self, id: FormatId) -> Option<&Format> {
        if id == 0 {
            return None;
        }
        self.table.get(id as usize - 1)
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
