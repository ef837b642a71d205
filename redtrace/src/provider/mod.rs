// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod dtrace;

use crate::probe::{ProviderAttributes, ProviderOps};

/// Providers every session starts with.
pub fn builtin() -> [(&'static dyn ProviderOps, ProviderAttributes); 1] {
    [(&dtrace::DTRACE, dtrace::PATTR)]
}
