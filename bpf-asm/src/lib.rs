// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Symbolic BPF instruction lists
//!
//! This crate models BPF code the way a code generator sees it before
//! linking: a linear list of typed instructions, each optionally carrying a
//! label and a reference to an external symbol that a later link stage
//! resolves. Nothing here encodes instructions into their binary form.
//!
//! ```
//! use bpf_asm::{Extern, Insn, IrList, JmpOp, Reg};
//!
//! let mut ir = IrList::new();
//! let exit = ir.label();
//! ir.emit(Insn::Call).set_extern(Extern::func("dt_predicate"));
//! ir.emit(Insn::BranchImm { op: JmpOp::Jeq, reg: Reg::R0, imm: 0, target: exit });
//! ir.append(Some(exit), Insn::Return);
//!
//! assert_eq!(ir.branch_targets(), vec![exit]);
//! ```

use std::fmt;

/// BPF registers. `Fp` is the read-only frame pointer (`%r10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    Fp,
}

impl Reg {
    /// Registers that survive a call. Everything else (`%r0`-`%r5`) is
    /// considered clobbered by the verifier once a call returns.
    pub const CALLEE_SAVED: [Reg; 4] = [Reg::R6, Reg::R7, Reg::R8, Reg::R9];

    /// Registers used to pass call arguments, in order.
    pub const ARGS: [Reg; 5] = [Reg::R1, Reg::R2, Reg::R3, Reg::R4, Reg::R5];

    pub fn index(self) -> u8 {
        match self {
            Reg::R0 => 0,
            Reg::R1 => 1,
            Reg::R2 => 2,
            Reg::R3 => 3,
            Reg::R4 => 4,
            Reg::R5 => 5,
            Reg::R6 => 6,
            Reg::R7 => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::Fp => 10,
        }
    }

    pub fn is_callee_saved(self) -> bool {
        Self::CALLEE_SAVED.contains(&self)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Fp => write!(f, "%fp"),
            r => write!(f, "%r{}", r.index()),
        }
    }
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    B,
    H,
    W,
    DW,
}

impl Size {
    pub fn bytes(self) -> usize {
        match self {
            Size::B => 1,
            Size::H => 2,
            Size::W => 4,
            Size::DW => 8,
        }
    }

    fn c_type(self) -> &'static str {
        match self {
            Size::B => "u8",
            Size::H => "u16",
            Size::W => "u32",
            Size::DW => "u64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Lsh,
    Rsh,
}

impl AluOp {
    fn symbol(self) -> &'static str {
        match self {
            AluOp::Add => "+=",
            AluOp::Sub => "-=",
            AluOp::And => "&=",
            AluOp::Or => "|=",
            AluOp::Lsh => "<<=",
            AluOp::Rsh => ">>=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpOp {
    Jeq,
    Jne,
    Jgt,
    Jge,
    Jlt,
    Jle,
}

impl JmpOp {
    fn symbol(self) -> &'static str {
        match self {
            JmpOp::Jeq => "==",
            JmpOp::Jne => "!=",
            JmpOp::Jgt => ">",
            JmpOp::Jge => ">=",
            JmpOp::Jlt => "<",
            JmpOp::Jle => "<=",
        }
    }
}

/// A code label. Labels are allocated by an [`IrList`] and only mean
/// something within that list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One symbolic instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// `dst = *(size *)(src + off)`
    Load { size: Size, dst: Reg, src: Reg, off: i16 },
    /// `*(size *)(dst + off) = src`
    Store { size: Size, dst: Reg, off: i16, src: Reg },
    /// `*(size *)(dst + off) = imm`
    StoreImm { size: Size, dst: Reg, off: i16, imm: i32 },
    /// `dst = src`
    MovReg { dst: Reg, src: Reg },
    /// `dst = imm`
    MovImm { dst: Reg, imm: i32 },
    /// 64-bit `dst op= imm`
    Alu64Imm { op: AluOp, dst: Reg, imm: i32 },
    /// `if reg op imm goto target`
    BranchImm { op: JmpOp, reg: Reg, imm: i32, target: Label },
    /// Call to the function named by the node's external symbol.
    Call,
    /// `return %r0`
    Return,
}

impl Insn {
    /// Registers this instruction writes.
    pub fn defs(&self) -> Vec<Reg> {
        match *self {
            Insn::Load { dst, .. } | Insn::MovReg { dst, .. } | Insn::MovImm { dst, .. } => {
                vec![dst]
            }
            Insn::Alu64Imm { dst, .. } => vec![dst],
            Insn::Call => vec![Reg::R0, Reg::R1, Reg::R2, Reg::R3, Reg::R4, Reg::R5],
            _ => vec![],
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Load { size, dst, src, off } => {
                write!(f, "{} = *({} *)({} {:+})", dst, size.c_type(), src, off)
            }
            Insn::Store { size, dst, off, src } => {
                write!(f, "*({} *)({} {:+}) = {}", size.c_type(), dst, off, src)
            }
            Insn::StoreImm { size, dst, off, imm } => {
                write!(f, "*({} *)({} {:+}) = {}", size.c_type(), dst, off, imm)
            }
            Insn::MovReg { dst, src } => write!(f, "{} = {}", dst, src),
            Insn::MovImm { dst, imm } => write!(f, "{} = {}", dst, imm),
            Insn::Alu64Imm { op, dst, imm } => write!(f, "{} {} {}", dst, op.symbol(), imm),
            Insn::BranchImm { op, reg, imm, target } => {
                write!(f, "if {} {} {} goto {}", reg, op.symbol(), imm, target)
            }
            Insn::Call => write!(f, "call"),
            Insn::Return => write!(f, "exit"),
        }
    }
}

/// A symbol resolved at link time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extern {
    /// A link-time constant patched into the instruction's immediate.
    Var(String),
    /// A function in the precompiled library or the compiled program.
    Func(String),
}

impl Extern {
    pub fn var(name: &str) -> Extern {
        Extern::Var(name.to_string())
    }

    pub fn func(name: &str) -> Extern {
        Extern::Func(name.to_string())
    }

    pub fn name(&self) -> &str {
        match self {
            Extern::Var(name) | Extern::Func(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrNode {
    pub label: Option<Label>,
    pub insn: Insn,
    pub extern_sym: Option<Extern>,
}

impl IrNode {
    pub fn set_extern(&mut self, sym: Extern) -> &mut Self {
        self.extern_sym = Some(sym);
        self
    }
}

impl fmt::Display for IrNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{:>5}: {}", label, self.insn)?,
            None => write!(f, "       {}", self.insn)?,
        }
        if let Some(sym) = &self.extern_sym {
            write!(f, " ! {}", sym.name())?;
        }
        Ok(())
    }
}

/// An append-only list of instruction nodes.
#[derive(Debug, Default, Clone)]
pub struct IrList {
    nodes: Vec<IrNode>,
    next_label: u32,
}

impl IrList {
    pub fn new() -> IrList {
        IrList::default()
    }

    /// Allocates a fresh label. It only becomes a jump target once a node
    /// carrying it is appended.
    pub fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn append(&mut self, label: Option<Label>, insn: Insn) -> &mut IrNode {
        self.nodes.push(IrNode {
            label,
            insn,
            extern_sym: None,
        });
        let last = self.nodes.len() - 1;
        &mut self.nodes[last]
    }

    pub fn emit(&mut self, insn: Insn) -> &mut IrNode {
        self.append(None, insn)
    }

    pub fn nodes(&self) -> &[IrNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IrNode> {
        self.nodes.iter()
    }

    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.nodes.iter().map(|n| &n.insn)
    }

    /// Position of the node carrying `label`.
    pub fn position(&self, label: Label) -> Option<usize> {
        self.nodes.iter().position(|n| n.label == Some(label))
    }

    /// Every label used as a branch target, in emission order.
    pub fn branch_targets(&self) -> Vec<Label> {
        let mut targets = vec![];
        for node in self.nodes.iter() {
            if let Insn::BranchImm { target, .. } = node.insn {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets
    }

    /// Nodes referring to an external symbol, in emission order.
    pub fn externs(&self) -> impl Iterator<Item = &Extern> {
        self.nodes.iter().filter_map(|n| n.extern_sym.as_ref())
    }
}

impl fmt::Display for IrList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            writeln!(f, "{:04} {}", i, node)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_labels_are_unique() {
        let mut ir = IrList::new();
        let a = ir.label();
        let b = ir.label();
        assert_ne!(a, b);
        assert!(ir.is_empty());
    }

    #[test]
    fn test_append_and_position() {
        let mut ir = IrList::new();
        let exit = ir.label();
        ir.emit(Insn::MovReg {
            dst: Reg::R6,
            src: Reg::R1,
        });
        ir.emit(Insn::BranchImm {
            op: JmpOp::Jeq,
            reg: Reg::R0,
            imm: 0,
            target: exit,
        });
        ir.append(Some(exit), Insn::Return);

        assert_eq!(ir.len(), 3);
        assert_eq!(ir.position(exit), Some(2));
        assert_eq!(ir.branch_targets(), vec![exit]);
    }

    #[test]
    fn test_extern_annotation() {
        let mut ir = IrList::new();
        ir.emit(Insn::Call).set_extern(Extern::func("dt_program"));
        ir.emit(Insn::Return);
        let names: Vec<_> = ir.externs().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["dt_program".to_string()]);
    }

    #[test]
    fn test_call_clobbers_scratch_registers() {
        let defs = Insn::Call.defs();
        for reg in Reg::ARGS.iter() {
            assert!(defs.contains(reg));
        }
        for reg in Reg::CALLEE_SAVED.iter() {
            assert!(!defs.contains(reg));
            assert!(reg.is_callee_saved());
        }
    }

    #[test]
    fn test_access_widths() {
        assert_eq!(Size::B.bytes(), 1);
        assert_eq!(Size::DW.bytes(), 8);
    }

    #[test]
    fn test_display() {
        let insn = Insn::StoreImm {
            size: Size::W,
            dst: Reg::Fp,
            off: -8,
            imm: 0,
        };
        assert_eq!(insn.to_string(), "*(u32 *)(%fp -8) = 0");
        assert_eq!(
            Insn::Load {
                size: Size::DW,
                dst: Reg::R0,
                src: Reg::R1,
                off: 16
            }
            .to_string(),
            "%r0 = *(u64 *)(%r1 +16)"
        );
    }
}
