// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Layout of the trace context a trampoline builds on its stack.
//!
//! ```c
//! struct dt_bpf_context {
//!     uint32_t    epid;
//!     uint32_t    pad;
//!     uint64_t    fault;
//!     dt_pt_regs  regs;
//!     uint64_t    argv[10];
//! };
//! ```

pub const DCTX_EPID: usize = 0;
pub const DCTX_PAD: usize = 4;
pub const DCTX_FAULT: usize = 8;
pub const DCTX_REGS: usize = 16;
pub const DCTX_ARGV: usize = DCTX_REGS + PT_REGS_SIZE;
/// Number of argument slots in the context.
pub const DCTX_ARGC: usize = 10;
pub const DCTX_SIZE: usize = DCTX_ARGV + DCTX_ARGC * 8;

/// Arguments passed in registers by the calling convention.
pub const PT_REGS_NARGS: usize = 6;

#[cfg(target_arch = "x86_64")]
pub const PT_REGS_SIZE: usize = 21 * 8;
/// Offsets of `rdi`, `rsi`, `rdx`, `rcx`, `r8` and `r9` in `struct pt_regs`.
#[cfg(target_arch = "x86_64")]
pub const PT_REGS_ARGS: [usize; PT_REGS_NARGS] = [112, 104, 96, 88, 72, 64];

#[cfg(target_arch = "aarch64")]
pub const PT_REGS_SIZE: usize = 34 * 8;
/// Offsets of `x0`-`x5` in `struct user_pt_regs`.
#[cfg(target_arch = "aarch64")]
pub const PT_REGS_ARGS: [usize; PT_REGS_NARGS] = [0, 8, 16, 24, 32, 40];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported target architecture");

/// Offset of `argv[i]` within the context.
pub const fn dctx_arg(i: usize) -> usize {
    DCTX_ARGV + i * 8
}

/// Frame pointer relative offset of a context field. The context sits at
/// the very top of the BPF stack.
pub const fn dctx_fp(off: usize) -> i16 {
    off as i16 - DCTX_SIZE as i16
}
