// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `dtrace` provider: the `BEGIN`, `END` and `ERROR` probes.

use std::rc::Rc;

use bpf_asm::{AluOp, Extern, Insn, IrList, JmpOp, Reg, Size};
use tracing::warn;

use crate::context::*;
use crate::error::Error;
use crate::probe::{
    Attribute, DependencyClass, ProbeRegistry, ProgType, Provider, ProviderAttributes,
    ProviderOps, Stability,
};

pub const PROBES: [&str; 3] = ["BEGIN", "END", "ERROR"];

pub const PATTR: ProviderAttributes = ProviderAttributes {
    provider: Attribute::new(Stability::Stable, Stability::Stable, DependencyClass::Common),
    module: Attribute::new(Stability::Private, Stability::Private, DependencyClass::Unknown),
    function: Attribute::new(Stability::Private, Stability::Private, DependencyClass::Unknown),
    name: Attribute::new(Stability::Stable, Stability::Stable, DependencyClass::Common),
    args: Attribute::new(Stability::Private, Stability::Unstable, DependencyClass::Unknown),
};

/// Link-time constant holding the enabled probe id.
pub const EPID_VAR: &str = "EPID";
pub const PREDICATE_FUNC: &str = "dt_predicate";
pub const PROGRAM_FUNC: &str = "dt_program";

pub struct DtraceProvider;

pub static DTRACE: DtraceProvider = DtraceProvider;

impl ProviderOps for DtraceProvider {
    fn name(&self) -> &'static str {
        "dtrace"
    }

    fn prog_type(&self) -> ProgType {
        ProgType::Kprobe
    }

    fn populate(
        &self,
        provider: &Rc<Provider>,
        registry: &mut dyn ProbeRegistry,
    ) -> (usize, Option<Error>) {
        for (n, name) in PROBES.iter().enumerate() {
            if let Err(e) = registry.insert(provider, "", "", name) {
                warn!("dtrace:::{} not registered: {}", name, e);
                return (n, Some(e));
            }
        }
        (PROBES.len(), None)
    }

    /// Generates
    ///
    /// ```c
    /// int dt_dtrace(dt_pt_regs *regs)
    /// {
    ///     struct dt_bpf_context dctx;
    ///
    ///     dctx.epid = EPID;
    ///     dctx.pad = 0;
    ///     dctx.fault = 0;
    ///     dctx.regs = *regs;
    ///     dctx.argv[0..6] = PT_REGS_PARAM1..6(regs);
    ///     dctx.argv[6..] = 0;
    ///
    ///     if (haspred && dt_predicate(regs, &dctx) == 0)
    ///         goto exit;
    ///     rc = dt_program(regs, &dctx);
    /// exit:
    ///     return rc;
    /// }
    /// ```
    fn trampoline(&self, ir: &mut IrList, has_predicate: bool) {
        let lbl_exit = ir.label();

        ir.emit(Insn::StoreImm {
            size: Size::W,
            dst: Reg::Fp,
            off: dctx_fp(DCTX_EPID),
            imm: -1,
        })
        .set_extern(Extern::var(EPID_VAR));
        ir.emit(Insn::StoreImm {
            size: Size::W,
            dst: Reg::Fp,
            off: dctx_fp(DCTX_PAD),
            imm: 0,
        });
        ir.emit(Insn::StoreImm {
            size: Size::DW,
            dst: Reg::Fp,
            off: dctx_fp(DCTX_FAULT),
            imm: 0,
        });

        for i in (0..PT_REGS_SIZE).step_by(Size::DW.bytes()) {
            copy_word(ir, i, DCTX_REGS + i);
        }

        for (i, off) in PT_REGS_ARGS.iter().enumerate() {
            copy_word(ir, *off, dctx_arg(i));
        }
        for i in PT_REGS_NARGS..DCTX_ARGC {
            ir.emit(Insn::StoreImm {
                size: Size::DW,
                dst: Reg::Fp,
                off: dctx_fp(dctx_arg(i)),
                imm: 0,
            });
        }

        // %r1 holds regs; dctx goes in %r2 as the second call argument.
        ir.emit(Insn::MovReg {
            dst: Reg::R2,
            src: Reg::Fp,
        });
        ir.emit(Insn::Alu64Imm {
            op: AluOp::Add,
            dst: Reg::R2,
            imm: dctx_fp(0) as i32,
        });

        if has_predicate {
            // The verifier marks %r1-%r5 unknown after any call.
            ir.emit(Insn::MovReg {
                dst: Reg::R6,
                src: Reg::R1,
            });
            ir.emit(Insn::MovReg {
                dst: Reg::R7,
                src: Reg::R2,
            });
            ir.emit(Insn::Call).set_extern(Extern::func(PREDICATE_FUNC));
            ir.emit(Insn::BranchImm {
                op: JmpOp::Jeq,
                reg: Reg::R0,
                imm: 0,
                target: lbl_exit,
            });
            ir.emit(Insn::MovReg {
                dst: Reg::R1,
                src: Reg::R6,
            });
            ir.emit(Insn::MovReg {
                dst: Reg::R2,
                src: Reg::R7,
            });
        }

        ir.emit(Insn::Call).set_extern(Extern::func(PROGRAM_FUNC));
        ir.append(Some(lbl_exit), Insn::Return);
    }
}

/// `dctx.<dst> = *(u64 *)(regs + src)`
fn copy_word(ir: &mut IrList, src: usize, dst: usize) {
    ir.emit(Insn::Load {
        size: Size::DW,
        dst: Reg::R0,
        src: Reg::R1,
        off: src as i16,
    });
    ir.emit(Insn::Store {
        size: Size::DW,
        dst: Reg::Fp,
        off: dctx_fp(dst),
        src: Reg::R0,
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Result;
    use crate::probe::{ProbeDescriptor, ProbeTable};
    use std::collections::HashSet;

    fn trampoline(has_predicate: bool) -> IrList {
        let mut ir = IrList::new();
        DTRACE.trampoline(&mut ir, has_predicate);
        ir
    }

    fn is_save_or_restore(insn: &Insn) -> bool {
        matches!(
            insn,
            Insn::MovReg {
                dst: Reg::R6,
                src: Reg::R1
            } | Insn::MovReg {
                dst: Reg::R7,
                src: Reg::R2
            } | Insn::MovReg {
                dst: Reg::R1,
                src: Reg::R6
            } | Insn::MovReg {
                dst: Reg::R2,
                src: Reg::R7
            }
        )
    }

    /// Walks the straight-line path that reaches the program call and
    /// checks `%r1` and `%r2` hold valid values at every call.
    fn assert_call_args_live(ir: &IrList) {
        let mut valid: HashSet<Reg> = [Reg::R1, Reg::Fp].iter().cloned().collect();
        for insn in ir.insns() {
            match *insn {
                Insn::Call => {
                    assert!(valid.contains(&Reg::R1), "%r1 clobbered before call");
                    assert!(valid.contains(&Reg::R2), "%r2 clobbered before call");
                    for r in insn.defs() {
                        valid.remove(&r);
                    }
                    valid.insert(Reg::R0);
                }
                Insn::MovReg { dst, src } => {
                    if valid.contains(&src) {
                        valid.insert(dst);
                    } else {
                        valid.remove(&dst);
                    }
                }
                _ => {
                    for r in insn.defs() {
                        valid.insert(r);
                    }
                }
            }
        }
    }

    #[test]
    fn test_trampoline_without_predicate() {
        let ir = trampoline(false);
        let insns: Vec<_> = ir.insns().collect();

        assert!(ir.branch_targets().is_empty());
        assert!(!insns.iter().any(|i| is_save_or_restore(i)));
        assert_eq!(insns.iter().filter(|i| ***i == Insn::Call).count(), 1);
        assert_eq!(*insns[insns.len() - 2], Insn::Call);
        assert_eq!(*insns[insns.len() - 1], Insn::Return);
        assert_eq!(
            insns.iter().filter(|i| ***i == Insn::Return).count(),
            1
        );

        let externs: Vec<_> = ir.externs().map(|e| e.name().to_string()).collect();
        assert_eq!(externs, vec![EPID_VAR, PROGRAM_FUNC]);
        assert_call_args_live(&ir);
    }

    #[test]
    fn test_trampoline_with_predicate() {
        let ir = trampoline(true);
        let nodes = ir.nodes();
        let n = nodes.len();

        let targets = ir.branch_targets();
        assert_eq!(targets.len(), 1);
        let exit = targets[0];
        assert_eq!(nodes.iter().filter(|n| n.label == Some(exit)).count(), 1);
        assert_eq!(ir.position(exit), Some(n - 1));
        assert_eq!(nodes[n - 1].insn, Insn::Return);

        let tail: Vec<_> = nodes[n - 8..].iter().map(|n| n.insn.clone()).collect();
        assert_eq!(
            tail,
            vec![
                Insn::MovReg {
                    dst: Reg::R6,
                    src: Reg::R1
                },
                Insn::MovReg {
                    dst: Reg::R7,
                    src: Reg::R2
                },
                Insn::Call,
                Insn::BranchImm {
                    op: JmpOp::Jeq,
                    reg: Reg::R0,
                    imm: 0,
                    target: exit
                },
                Insn::MovReg {
                    dst: Reg::R1,
                    src: Reg::R6
                },
                Insn::MovReg {
                    dst: Reg::R2,
                    src: Reg::R7
                },
                Insn::Call,
                Insn::Return,
            ]
        );
        assert!(!nodes[..n - 8].iter().any(|n| is_save_or_restore(&n.insn)));

        let externs: Vec<_> = ir.externs().map(|e| e.name().to_string()).collect();
        assert_eq!(externs, vec![EPID_VAR, PREDICATE_FUNC, PROGRAM_FUNC]);
        assert_call_args_live(&ir);
    }

    #[test]
    fn test_context_init() {
        let ir = trampoline(false);
        let insns: Vec<_> = ir.insns().cloned().collect();

        assert_eq!(
            insns[0],
            Insn::StoreImm {
                size: Size::W,
                dst: Reg::Fp,
                off: dctx_fp(DCTX_EPID),
                imm: -1
            }
        );
        assert_eq!(ir.nodes()[0].extern_sym, Some(Extern::var(EPID_VAR)));

        let stores: Vec<i16> = insns
            .iter()
            .filter_map(|i| match *i {
                Insn::Store {
                    dst: Reg::Fp, off, ..
                } => Some(off),
                _ => None,
            })
            .collect();
        assert_eq!(stores.len(), PT_REGS_SIZE / 8 + PT_REGS_NARGS);
        assert_eq!(stores[0], dctx_fp(DCTX_REGS));
        assert_eq!(stores[PT_REGS_SIZE / 8], dctx_fp(dctx_arg(0)));

        let zeroed: Vec<i16> = insns
            .iter()
            .filter_map(|i| match *i {
                Insn::StoreImm {
                    size: Size::DW,
                    off,
                    imm: 0,
                    ..
                } => Some(off),
                _ => None,
            })
            .collect();
        let mut expected = vec![dctx_fp(DCTX_FAULT)];
        expected.extend((PT_REGS_NARGS..DCTX_ARGC).map(|i| dctx_fp(dctx_arg(i))));
        assert_eq!(zeroed, expected);

        let loads: Vec<i16> = insns
            .iter()
            .filter_map(|i| match *i {
                Insn::Load { src: Reg::R1, off, .. } => Some(off),
                _ => None,
            })
            .collect();
        for (i, off) in PT_REGS_ARGS.iter().enumerate() {
            assert_eq!(loads[PT_REGS_SIZE / 8 + i], *off as i16);
        }
    }

    struct FailingRegistry {
        table: ProbeTable,
        allow: usize,
    }

    impl ProbeRegistry for FailingRegistry {
        fn insert(
            &mut self,
            provider: &Rc<Provider>,
            module: &str,
            function: &str,
            name: &str,
        ) -> Result<Rc<ProbeDescriptor>> {
            if self.allow == 0 {
                return Err(Error::NoMem);
            }
            self.allow -= 1;
            self.table.insert(provider, module, function, name)
        }
    }

    #[test]
    fn test_populate() {
        let mut table = ProbeTable::new();
        let prv = table.add_provider(&DTRACE, PATTR).unwrap();
        assert_eq!(DTRACE.populate(&prv, &mut table), (3, None));
        assert_eq!(table.len(), 3);
        let names: Vec<_> = table.iter().map(|p| p.to_string()).collect();
        assert_eq!(names, vec!["dtrace:::BEGIN", "dtrace:::END", "dtrace:::ERROR"]);
        assert_eq!(prv.attr.args.data, Stability::Unstable);
        assert_eq!(prv.attr.name.class, DependencyClass::Common);
        assert_eq!(prv.ops.prog_type(), ProgType::Kprobe);

        assert_eq!(DTRACE.populate(&prv, &mut table), (3, None));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_populate_partial() {
        for allow in 0..3 {
            let mut reg = FailingRegistry {
                table: ProbeTable::new(),
                allow,
            };
            let prv = reg.table.add_provider(&DTRACE, PATTR).unwrap();
            assert_eq!(
                DTRACE.populate(&prv, &mut reg),
                (allow, Some(Error::NoMem))
            );
            assert_eq!(reg.table.len(), allow);
        }
    }
}
