//! Implements the secure-run verifier: a final sweep run after `end_run` and before a result is
//! handed off to the prover (spec.md §4.11).
//!
//! Grounded in the reference cairo-vm's `vm::security::verify_secure_runner`
//! (`other_examples/…src-vm-security.rs.rs`), adapted to this crate's [`CairoVM`]/[`Memory`]
//! split instead of a `CairoRunner`/`VirtualMachine` pair.

use crate::builtin::Builtin;
use crate::error::Error;
use crate::memory::Pointer;
use crate::CairoVM;

/// Runs the secure-run sweep described in spec.md §4.11 against an already-finalized [`CairoVM`].
///
/// Checks, in order:
/// 1. every builtin's used cell count does not exceed its declared stop pointer
///    (`OutOfBoundsBuiltinSegmentAccess`);
/// 2. the program segment's used size does not exceed the program data length
///    (`OutOfBoundsProgramSegmentAccess`);
/// 3. if any temporary memory was ever allocated, no value reachable in the relocated-eligible
///    memory still carries a negative segment index (`InvalidMemoryAddress`);
/// 4. every builtin's own [`Builtin::run_security_checks`] passes.
pub fn verify_secure_run(
    vm: &CairoVM,
    program_base: Pointer,
    program_data_len: usize,
    verify_builtins: bool,
) -> Result<(), Error> {
    if verify_builtins {
        for builtin in vm.builtins().iter() {
            let Some(stop_ptr) = builtin.stop_ptr() else {
                continue;
            };
            let used = builtin.get_used_cells(vm.memory())?;
            // `+ 1`: the highest valid offset within a segment of `used` cells is `used - 1`.
            if used >= stop_ptr.offset + 1 {
                return Err(Error::OutOfBoundsBuiltinSegmentAccess(builtin.name()));
            }
        }
    }

    let program_segment = unsafe { vm.memory().segment_unchecked(program_base.segment as usize) };
    if program_segment.highest_known_cell() >= program_data_len + 1 {
        return Err(Error::OutOfBoundsProgramSegmentAccess);
    }

    if vm.memory().has_temporary_data() {
        vm.memory().for_each_reachable_pointer(|pointer| {
            if pointer.segment < 0 {
                Err(Error::InvalidMemoryAddress(pointer))
            } else {
                Ok(())
            }
        })?;
    }

    if verify_builtins {
        for builtin in vm.builtins().iter() {
            builtin.run_security_checks(vm.memory())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinKind;
    use crate::cpu::Cpu;
    use crate::memory::{Memory, ValueRef};
    use starknet_types_core::felt::Felt;

    fn base_vm() -> (CairoVM, Pointer) {
        let mut memory = Memory::new();
        let program_base = memory.add_segment();
        let exec_base = memory.add_segment();
        let cpu = Cpu {
            pc: program_base,
            ap: exec_base,
            fp: exec_base,
        };
        (CairoVM::new(cpu, memory, crate::builtin::BuiltinManager::new()), program_base)
    }

    #[test]
    fn succeeds_on_empty_memory() {
        let (vm, program_base) = base_vm();
        assert!(verify_secure_run(&vm, program_base, 0, true).is_ok());
    }

    #[test]
    fn detects_program_segment_overflow() {
        let (mut vm, program_base) = base_vm();
        vm.memory_mut()
            .assert_eq(program_base.wrapping_add(3), ValueRef::Scalar(&Felt::from(7)))
            .unwrap();
        assert!(matches!(
            verify_secure_run(&vm, program_base, 2, true),
            Err(Error::OutOfBoundsProgramSegmentAccess)
        ));
    }

    #[test]
    fn detects_out_of_bounds_builtin_access() {
        let (mut vm, program_base) = base_vm();

        vm.builtins_mut().add(
            BuiltinKind::Output(crate::builtin::OutputBuiltin::default()),
            vm.memory_mut(),
        );
        let segment = vm.builtins().iter().next().unwrap().base().segment as usize;

        // Two cells get written to the output segment...
        vm.memory_mut()
            .assert_eq(Pointer::real(segment, 0), ValueRef::Scalar(&Felt::from(1)))
            .unwrap();
        vm.memory_mut()
            .assert_eq(Pointer::real(segment, 1), ValueRef::Scalar(&Felt::from(2)))
            .unwrap();

        // ... but the stop pointer written to the stack only declares one used cell.
        let stack_slot = Pointer::real(segment, 10);
        vm.memory_mut()
            .assert_eq(
                stack_slot.wrapping_sub(1),
                ValueRef::Pointer(&Pointer::real(segment, 1)),
            )
            .unwrap();
        vm.builtins_mut()
            .final_stacks(vm.memory(), stack_slot)
            .unwrap();

        assert!(matches!(
            verify_secure_run(&vm, program_base, 0, true),
            Err(Error::OutOfBoundsBuiltinSegmentAccess("output"))
        ));
    }
}
