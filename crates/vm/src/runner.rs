//! Drives the full lifecycle of a run: segment layout, entrypoint setup, the step loop, end-of-run
//! finalization, and public-input assembly (spec.md §4.10).
//!
//! Grounded in the reference cairo-vm's `CairoRunner` (`initialize_segments` /
//! `initialize_main_entrypoint` / `initialize_vm` / `run_until_pc` / `end_run` /
//! `relocate`/`get_air_public_input`), re-expressed over this crate's [`CairoVM`]/[`BuiltinManager`]
//! split.

use starknet_types_core::felt::Felt;

use crate::builtin::{Builtin, BuiltinKind, BuiltinManager};
use crate::cpu::Cpu;
use crate::error::{Error, RunnerError};
use crate::hints::{ExecutionScopes, HintProcessor};
use crate::memory::{CairoArg, Memory, Pointer, Value, ValueRef};
use crate::program::Program;
use crate::public_input::{build_public_input, PublicInput};
use crate::secure_run::verify_secure_run;
use crate::trace::VecTrace;
use crate::CairoVM;

/// Returns the builtins a named layout requires, in canonical order.
///
/// The source spec treats layout selection as CLI plumbing ("collaborator shape, listed for
/// completeness"); the handful of names below mirror the reference cairo-vm's own built-in
/// layouts closely enough to exercise [`Runner::new`]'s missing-builtin/disordered-builtin
/// checks without pulling in the full layout-configuration system.
fn layout_builtins(layout: &str) -> Result<&'static [&'static str], Error> {
    Ok(match layout {
        "plain" => &[],
        "small" => &["output", "pedersen", "range_check", "ecdsa"],
        "dex" => &["output", "pedersen", "range_check", "ecdsa", "bitwise"],
        "recursive" => &["output", "pedersen", "range_check", "bitwise"],
        "starknet" => &[
            "output",
            "pedersen",
            "range_check",
            "ecdsa",
            "bitwise",
            "ec_op",
            "poseidon",
        ],
        "all_cairo" => BuiltinKind::CANONICAL_ORDER,
        other => {
            return Err(RunnerError::InvalidInput(format!("unknown layout `{other}`")).into())
        }
    })
}

/// Drives a single run of a [`Program`] from its main entrypoint to completion.
///
/// Owns the [`CairoVM`], the [`ExecutionScopes`] a hint processor threads state through, and the
/// [`VecTrace`] recorded along the way. Call the phases in order: [`Runner::new`] covers spec.md
/// §4.10 steps 1-4 (initialize segments/state/entrypoint/vm), [`Runner::run_until_pc`] covers step
/// 5, [`Runner::end_run`] covers step 6, and [`Runner::finalize`] covers step 7.
#[derive(Debug)]
pub struct Runner<H> {
    vm: CairoVM,
    program: Program,
    program_base: Pointer,
    final_pc: Pointer,
    exec_scopes: ExecutionScopes,
    hint_processor: H,
    trace: VecTrace,
    run_finished: bool,
}

impl<H: HintProcessor> Runner<H> {
    /// Initializes segments, loads the program image, seeds the initial call stack, and sets up
    /// the initial register state (spec.md §4.10 steps 1-4).
    pub fn new(
        program: Program,
        layout: &str,
        allow_missing_builtins: bool,
        hint_processor: H,
    ) -> Result<Self, Error> {
        let required = layout_builtins(layout)?;

        let mut last_index = None;
        for name in &program.builtins {
            let index = BuiltinKind::CANONICAL_ORDER
                .iter()
                .position(|candidate| candidate == name)
                .ok_or_else(|| {
                    Error::from(RunnerError::InvalidInput(format!("unknown builtin `{name}`")))
                })?;
            if last_index.is_some_and(|last| index <= last) {
                return Err(Error::DisorderedBuiltins);
            }
            last_index = Some(index);
        }

        if !allow_missing_builtins {
            for &name in required {
                if !program.builtins.iter().any(|declared| declared == name) {
                    return Err(Error::MissingBuiltin(name));
                }
            }
        }

        // 1. Initialize segments: program, execution, then one per declared builtin.
        let mut memory = Memory::new();
        let program_base = memory.add_segment();
        let execution_base = memory.add_segment();

        let mut builtins = BuiltinManager::new();
        for name in &program.builtins {
            if let Some(kind) = BuiltinKind::from_name(name) {
                builtins.add(kind, &mut memory);
            }
        }

        // 2. Initialize state: load the program image, then the initial call stack (builtin
        // bases, then a sentinel return-fp and end label), written through the same `CairoArg`
        // convention a hint-seeded entrypoint argument would use.
        memory.load_data(program_base, &program.data)?;

        let main_offset = program.main_offset().ok_or(Error::NoMain)?;
        let initial_pc = program_base.wrapping_add(main_offset);
        let final_pc = program_base.wrapping_add(program.data.len());

        let return_fp = execution_base;
        let stack_args = CairoArg::Composed(
            builtins
                .iter()
                .map(|builtin| CairoArg::Single(Value::Pointer(builtin.base())))
                .chain([
                    CairoArg::Single(Value::Pointer(return_fp)),
                    CairoArg::Single(Value::Pointer(final_pc)),
                ])
                .collect(),
        );
        let cursor = memory.write_arg(execution_base, &stack_args)?;

        // 3. Initialize main entrypoint: `initial_fp = initial_ap = execution_base + |stack|`.
        let initial_ap = cursor;
        let initial_fp = cursor;

        // 4. Initialize VM: write pc/ap/fp. Builtin validation rules were already installed by
        // `BuiltinManager::add` above.
        let cpu = Cpu {
            pc: initial_pc,
            ap: initial_ap,
            fp: initial_fp,
        };
        let vm = CairoVM::new(cpu, memory, builtins);

        log::info!(
            "starting run: layout `{layout}`, entrypoint pc={initial_pc:?}, final pc={final_pc:?}"
        );

        Ok(Self {
            vm,
            program,
            program_base,
            final_pc,
            exec_scopes: ExecutionScopes::new(),
            hint_processor,
            trace: VecTrace::new(),
            run_finished: false,
        })
    }

    /// Returns the underlying [`CairoVM`].
    pub fn vm(&self) -> &CairoVM {
        &self.vm
    }

    /// Returns the recorded, unrelocated trace.
    pub fn trace(&self) -> &VecTrace {
        &self.trace
    }

    /// Returns the program this runner is executing.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// 5. Run until PC: steps the VM until `pc == final_pc`, running the hint processor once per
    /// step beforehand, capped at `max_steps` (spec.md §5 "Cancellation/timeouts").
    pub fn run_until_pc(&mut self, max_steps: usize) -> Result<(), Error> {
        while self.vm.cpu().pc != self.final_pc {
            if self.vm.step_count() >= max_steps {
                return Err(Error::StepLimitExceeded(max_steps));
            }

            let pc_offset = self.vm.cpu().pc.offset;
            if let Some(hints) = self.program.hints.get(&pc_offset) {
                let hints = hints.clone();
                self.hint_processor.execute_hints(
                    &mut self.vm,
                    &mut self.exec_scopes,
                    &hints,
                    &self.program.constants,
                )?;
            }

            self.vm.step(&mut self.trace)?;
        }

        log::info!("run reached final pc after {} steps", self.vm.step_count());
        Ok(())
    }

    /// 6. End run: marks the run finished, verifies every builtin's automatic deductions are
    /// still consistent, reads each builtin's final stack pointer, and runs their security
    /// checks (spec.md §4.10 step 6).
    pub fn end_run(&mut self, verify_builtins: bool) -> Result<(), Error> {
        verify_auto_deductions(&self.vm)?;

        let stack_top = self.vm.cpu().ap;
        self.vm.final_stacks(stack_top)?;

        if verify_builtins {
            for builtin in self.vm.builtins().iter() {
                builtin.run_security_checks(self.vm.memory())?;
            }
        }

        self.run_finished = true;
        log::debug!("run ended, final stacks read back");
        Ok(())
    }

    /// Runs the secure-run sweep of spec.md §4.11 against the already-ended run.
    pub fn verify_secure_run(&self, verify_builtins: bool) -> Result<(), Error> {
        verify_secure_run(
            &self.vm,
            self.program_base,
            self.program.data.len(),
            verify_builtins,
        )
    }

    /// 7. Finalize: relocates memory and the trace into a single flat address space and
    /// assembles the [`PublicInput`] (spec.md §4.10 step 7, §4.12).
    pub fn finalize(&mut self, layout: &str) -> Result<(Vec<Option<Felt>>, PublicInput), Error> {
        let bases = self.vm.memory().relocate_segments();
        self.trace.relocate(self.vm.memory())?;
        let relocated_memory = self.vm.memory_mut().relocate()?;
        let relocated_trace = self.trace.relocated()?;

        let public_input = build_public_input(
            layout,
            self.vm.memory(),
            &relocated_memory,
            relocated_trace,
            self.vm.rc_limits(),
            self.vm.builtins(),
            &bases,
        )?;

        log::info!(
            "finalized run: {} steps, layout `{layout}`",
            public_input.n_steps
        );
        Ok((relocated_memory, public_input))
    }
}

/// Re-runs every builtin's [`Builtin::deduce_memory_cell`] against the cells actually written in
/// its segment, failing if any written value differs from what the builtin itself would have
/// deduced (spec.md §4.10 "verify auto-deductions for every touched builtin segment cell").
fn verify_auto_deductions(vm: &CairoVM) -> Result<(), Error> {
    for builtin in vm.builtins().iter() {
        let base = builtin.base();
        // SAFETY: every builtin's segment was allocated by `BuiltinManager::add` before the run
        // started.
        let len = unsafe { vm.memory().segment_unchecked(base.segment as usize) }.highest_known_cell();

        for offset in 0..len {
            let address = base.wrapping_add(offset);
            let Some(deduced) = builtin
                .deduce_memory_cell(address, vm.memory())
                .map_err(Error::from)?
            else {
                continue;
            };

            let actual = vm.memory().get(address)?;
            let consistent = match (&deduced, actual) {
                (Value::Scalar(d), Some(ValueRef::Scalar(a))) => d == a,
                (Value::Pointer(d), Some(ValueRef::Pointer(a))) => d == a,
                (_, None) => true,
                _ => false,
            };
            if !consistent {
                return Err(Error::Contradiction(address));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints::NoopHintProcessor;
    use starknet_types_core::felt::Felt;

    /// A single `ret` instruction, encoded directly from the bit layout spec.md §3/§4.2 and
    /// `instr.rs` define: `dst_reg=FP, off_dst=-2` (return fp), `op0_reg=FP, off_op0=-1` and
    /// `op1_src=FP, off_op1=-1` (both read the return pc from the same cell), `res_logic=Op1`,
    /// `pc_update=AbsoluteJump`, `ap_update=Regular`, `opcode=Ret`.
    fn ret_instruction() -> Felt {
        let off_dst = 0x8000u64 - 2;
        let off_op0 = 0x8000u64 - 1;
        let off_op1 = 0x8000u64 - 1;
        let dst_reg = 1u64; // FP
        let op0_reg = 1u64; // FP
        let op1_src = 2u64; // FP
        let res_logic = 0u64; // Op1
        let pc_update = 1u64; // AbsoluteJump
        let ap_update = 0u64; // Regular
        let opcode = 2u64; // Ret

        let flags = dst_reg
            | (op0_reg << 1)
            | (op1_src << 2)
            | (res_logic << 5)
            | (pc_update << 7)
            | (ap_update << 10)
            | (opcode << 12);

        let word = off_dst | (off_op0 << 16) | (off_op1 << 32) | (flags << 48);
        Felt::from(word)
    }

    /// `[ap] = 5; ap++`, encoded the same way: `dst_reg=AP, off_dst=0`, `op1_src=Imm, off_op1=1`
    /// (the immediate follows in the next cell), `res_logic=Op1`, `ap_update=Add1`,
    /// `opcode=AssertEq`. `op0` is left unconstrained (its register/offset are never read since
    /// `res_logic=Op1` ignores `op0` entirely).
    fn assert_eq_imm_instruction() -> Felt {
        let off_dst = 0x8000u64;
        let off_op0 = 0x8000u64;
        let off_op1 = 0x8000u64 + 1;
        let dst_reg = 0u64; // AP
        let op0_reg = 0u64; // AP
        let op1_src = 1u64; // Imm
        let res_logic = 0u64; // Op1
        let pc_update = 0u64; // Regular
        let ap_update = 2u64; // Add1
        let opcode = 4u64; // AssertEq

        let flags = dst_reg
            | (op0_reg << 1)
            | (op1_src << 2)
            | (res_logic << 5)
            | (pc_update << 7)
            | (ap_update << 10)
            | (opcode << 12);

        let word = off_dst | (off_op0 << 16) | (off_op1 << 32) | (flags << 48);
        Felt::from(word)
    }

    fn trivial_program() -> Program {
        Program {
            data: vec![assert_eq_imm_instruction(), Felt::from(5u64), ret_instruction()],
            main: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_unknown_layout() {
        let err = Runner::new(trivial_program(), "not_a_layout", true, NoopHintProcessor)
            .unwrap_err();
        assert!(matches!(err, Error::Runner(RunnerError::InvalidInput(_))));
    }

    #[test]
    fn rejects_missing_required_builtin() {
        let err = Runner::new(trivial_program(), "small", false, NoopHintProcessor).unwrap_err();
        assert!(matches!(err, Error::MissingBuiltin("output")));
    }

    #[test]
    fn plain_layout_allows_a_builtinless_program() {
        let runner = Runner::new(trivial_program(), "plain", false, NoopHintProcessor).unwrap();
        assert_eq!(runner.vm().builtins().len(), 0);
        assert_eq!(runner.vm().cpu().pc, runner.program_base.wrapping_add(0));
    }

    #[test]
    fn rejects_disordered_builtins() {
        let mut program = trivial_program();
        program.builtins = vec!["range_check".to_owned(), "output".to_owned()];
        let err = Runner::new(program, "plain", true, NoopHintProcessor).unwrap_err();
        assert!(matches!(err, Error::DisorderedBuiltins));
    }

    #[test]
    fn runs_a_trivial_program_to_completion_and_finalizes() {
        let mut runner =
            Runner::new(trivial_program(), "plain", false, NoopHintProcessor).unwrap();

        runner.run_until_pc(16).unwrap();
        assert_eq!(runner.vm().step_count(), 2);
        assert_eq!(runner.vm().cpu().pc, runner.final_pc);

        runner.end_run(true).unwrap();
        runner.verify_secure_run(true).unwrap();

        let (relocated_memory, public_input) = runner.finalize("plain").unwrap();
        assert!(!relocated_memory.is_empty());
        assert_eq!(public_input.n_steps, 2);
        assert_eq!(public_input.layout, "plain");
    }

    #[test]
    fn step_limit_is_enforced() {
        let mut runner =
            Runner::new(trivial_program(), "plain", false, NoopHintProcessor).unwrap();
        let err = runner.run_until_pc(0).unwrap_err();
        assert!(matches!(err, Error::StepLimitExceeded(0)));
    }
}
