//! # Rayquaza
//!
//! A high performance Cairo virtual machine implementation
//!
//! # Documentation
//!
//! - [The Cairo Whitepaper](https://www.cairo-lang.org/cairo-whitepaper/).

#![warn(missing_docs, missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

use bitflags::bitflags;
use num_traits::ToPrimitive;
use starknet_types_core::felt::Felt;

use builtin::BuiltinManager;
use cpu::Cpu;
use error::Error;
use instr::{ApUpdate, FpUpdate, Instruction, OpCode, PcUpdate, ResultLogic};
use memory::{Memory, Pointer, Value, ValueRef};
use trace::{Trace, TraceEntry};

pub mod builtin;
pub mod cpu;
pub mod error;
pub mod hints;
pub mod instr;
pub mod memory;
pub mod program;
pub mod public_input;
pub mod runner;
pub mod secure_run;
pub mod trace;

/// Contains the full state of a Cairo virtual machine.
///
/// This includes memory, registers, builtins, etc. It can be used to execute a Cairo program
/// and gather execution statistics, traces and other related information.
///
/// # Field
///
/// Technically, the Cairo language allows any prime field to be used as the underlying field
/// for the virtual machine. However, in practice, the only field that this crate is meant to
/// be used is the Starknet field element [`Felt`]. For this reason, it is not possible to change
/// the underlying field of the virtual machine.
///
/// If you need to use another field, feel free to [open an issue](https://github.com/KasarLabs/rayquaza/issues/new).
///
/// # Components
///
/// The [`CairoVM`] is composed of three main components:
///
/// - [`Cpu`]: The central processing unit of the virtual machine, responsible for holding registers
///   and interacting with the memory.
///
/// - [`Memory`]: The memory associated with the virtual machine. Instructions and working memory
///   are stored here.
///
/// - [`BuiltinManager`]: Routes automatic operand deduction to whichever builtin owns the
///   segment being read.
#[derive(Debug)]
pub struct CairoVM {
    /// The central processing unit of the virtual machine, responsible for holding registers
    /// and interacting with the memory.
    cpu: Cpu,
    /// The memory associated with the virtual machine.
    ///
    /// Instructions and working memory are stored here.
    memory: Memory,
    /// The built-in functions that the virtual machine can execute.
    builtins: BuiltinManager,
    /// The number of steps executed so far.
    step_count: usize,
    /// The running minimum and maximum of every re-centered instruction offset seen so far,
    /// used to derive the public input's range-check bound on the instruction encoding itself
    /// (distinct from the range-check *builtin*'s own bookkeeping).
    ///
    /// Re-centered into `[0, 2^16)` (spec.md §3 "Range-check limits"): the signed, unbiased
    /// offset an instruction decodes to (spec.md §4.2) plus `2^15`, recovering the original
    /// unsigned bit pattern the instruction word actually carries.
    rc_limits: Option<(u16, u16)>,
}

impl CairoVM {
    /// Creates a new [`CairoVM`] from its already-initialized components.
    ///
    /// Building a [`CairoVM`] from scratch (loading a program, allocating builtin segments,
    /// seeding the initial stack) is the responsibility of [`crate::runner::Runner`]; this
    /// constructor only assembles an already-prepared machine.
    pub fn new(cpu: Cpu, memory: Memory, builtins: BuiltinManager) -> Self {
        Self {
            cpu,
            memory,
            builtins,
            step_count: 0,
            rc_limits: None,
        }
    }

    /// Returns the current state of the [`Cpu`].
    #[inline(always)]
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Returns the current state of the [`Memory`].
    #[inline(always)]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Returns the current state of the [`Memory`], mutably.
    #[inline(always)]
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Returns the builtin manager driving this run.
    #[inline(always)]
    pub fn builtins(&self) -> &BuiltinManager {
        &self.builtins
    }

    /// Returns the builtin manager driving this run, mutably.
    #[inline(always)]
    pub fn builtins_mut(&mut self) -> &mut BuiltinManager {
        &mut self.builtins
    }

    /// Reads every builtin's final stack pointer off the execution stack, starting at
    /// `stack_top` (spec.md §4.10 "end run"). Splits the borrow between `memory` and `builtins`
    /// directly, since both are independently owned fields of this struct.
    pub fn final_stacks(&mut self, stack_top: Pointer) -> Result<Pointer, Error> {
        self.builtins.final_stacks(&self.memory, stack_top)
    }

    /// Returns the number of steps executed so far.
    #[inline(always)]
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Returns the running minimum and maximum re-centered instruction offset observed so far,
    /// if at least one step has run.
    #[inline(always)]
    pub fn rc_limits(&self) -> Option<(u16, u16)> {
        self.rc_limits
    }

    /// Advances the virtual machine by a single step, recording events into the provided
    /// [`Trace`] implementation.
    ///
    /// Implements spec.md §4.4 (operand computation), §4.5 (opcode assertions), §4.6 (builtin
    /// dispatch), and §4.7 (register update, applied in FP → AP → PC order).
    pub fn step<T>(&mut self, trace: &mut T) -> Result<(), Error>
    where
        T: ?Sized + Trace,
    {
        let instruction = fetch_instruction(&self.cpu, &self.memory)?;

        if instruction.is_last_bit_set() {
            return Err(Error::NonZeroHighBit);
        }

        trace.push(TraceEntry {
            pc: self.cpu.pc,
            ap: self.cpu.ap,
            fp: self.cpu.fp,
        });

        let mut ctx = StepContext::new(instruction);
        compute_dst(&mut ctx, self)?;
        compute_op0(&mut ctx, self)?;
        compute_op1(&mut ctx, self)?;
        run_builtins(&mut ctx, self)?;
        deduce_from_op_code(&mut ctx, self)?;
        compute_res(&mut ctx)?;
        apply_op_code_assertions(&mut ctx)?;
        commit_operands(&mut ctx, self)?;
        update_rc_limits(&mut ctx, self);
        update_registers(&ctx, self)?;

        self.step_count += 1;

        Ok(())
    }
}

/// Attempts to fetch an instruction from the provided [`Memory`].
///
/// The returned instruction is the one directly referenced by the **Program Counter** of the
/// [`Cpu`] instance. Note that the instruction is not actually decoded in any way, meaning
/// that it might be missing an eventual associated immediate value.
fn fetch_instruction(cpu: &Cpu, memory: &Memory) -> Result<Instruction, Error> {
    let scalar = memory
        .get(cpu.pc)?
        .ok_or(Error::ProgramCounterLost(cpu.pc))?
        .scalar()
        .ok_or(Error::ProgramCounterLost(cpu.pc))?;

    Ok(Instruction(
        scalar.to_u64().ok_or(Error::UndefinedInstruction)?,
    ))
}

/// Determines what the destination address of an instruction is, and reads it from memory if
/// already known.
fn compute_dst(ctx: &mut StepContext, vm: &mut CairoVM) -> Result<(), Error> {
    ctx.dst_addr = match ctx.instruction.dst_register() {
        instr::DstRegister::AP => vm.cpu.ap,
        instr::DstRegister::FP => vm.cpu.fp,
    };
    ctx.dst_addr = offset_addr(ctx.dst_addr, ctx.instruction.dst_offset());

    if let Some(val) = vm.memory.get_and_mark_accessed(ctx.dst_addr)? {
        ctx.dst = Some(val.copied());
    }

    Ok(())
}

/// Determines what the address of the first operand of an instruction is, and reads it from
/// memory if already known.
fn compute_op0(ctx: &mut StepContext, vm: &mut CairoVM) -> Result<(), Error> {
    ctx.op0_addr = match ctx.instruction.op0_register() {
        instr::Op0Register::AP => vm.cpu.ap,
        instr::Op0Register::FP => vm.cpu.fp,
    };
    ctx.op0_addr = offset_addr(ctx.op0_addr, ctx.instruction.op0_offset());

    if let Some(val) = vm.memory.get_and_mark_accessed(ctx.op0_addr)? {
        ctx.op0 = Some(val.copied());
    }

    Ok(())
}

/// Determines what the address of the second operand of an instruction is, and reads it from
/// memory if already known.
///
/// This function also updates the `instr_size` field of the provided context.
fn compute_op1(ctx: &mut StepContext, vm: &mut CairoVM) -> Result<(), Error> {
    match ctx.instruction.op1_source()? {
        instr::Op1Source::Op0 => {
            if ctx.op0.is_none() {
                return Err(Error::UnknownOp0);
            }
            ctx.op1_addr = ctx.op0_addr;
        }
        instr::Op1Source::Imm => {
            if ctx.instruction.op1_offset() != 1 {
                return Err(Error::ImmShouldBe1);
            }
            ctx.op1_addr = vm.cpu.pc;
            ctx.flags.insert(StepContextFlags::SIZE_TWO);
        }
        instr::Op1Source::FP => ctx.op1_addr = vm.cpu.fp,
        instr::Op1Source::AP => ctx.op1_addr = vm.cpu.ap,
    }

    ctx.op1_addr = offset_addr(ctx.op1_addr, ctx.instruction.op1_offset());

    if let Some(val) = vm.memory.get_and_mark_accessed(ctx.op1_addr)? {
        ctx.op1 = Some(val.copied());
    }

    Ok(())
}

/// Applies a signed, re-centered offset to a base pointer using wrapping arithmetic.
///
/// The offset is known to fit in `i16` (spec.md §4.2), so it can never overflow a realistic
/// segment offset; wrapping is used purely to avoid a panic on pathological input rather than
/// because overflow is an expected case.
#[inline(always)]
fn offset_addr(base: Pointer, offset: i16) -> Pointer {
    if offset >= 0 {
        base.wrapping_add(offset as usize)
    } else {
        base.wrapping_sub(offset.unsigned_abs() as usize)
    }
}

/// Runs the builtins when applicable to deduce the missing operands of an instruction.
fn run_builtins(ctx: &mut StepContext, vm: &CairoVM) -> Result<(), Error> {
    if ctx.op0.is_none() {
        if let Some(value) = vm.builtins.deduce(ctx.op0_addr, &vm.memory)? {
            ctx.op0 = Some(value);
            ctx.flags.insert(StepContextFlags::OP0_DEDUCED);
        }
    }

    if ctx.op1.is_none() {
        if let Some(value) = vm.builtins.deduce(ctx.op1_addr, &vm.memory)? {
            ctx.op1 = Some(value);
            ctx.flags.insert(StepContextFlags::OP1_DEDUCED);
        }
    }

    Ok(())
}

/// Attempt to deduce missing operands from the OP-Code of the instruction (spec.md §4.5).
fn deduce_from_op_code(ctx: &mut StepContext, vm: &CairoVM) -> Result<(), Error> {
    match ctx.instruction.op_code()? {
        OpCode::Call => {
            // `op0` must be asserted to `pc + instruction_size`.
            let expected_op0: Value = vm.cpu.pc.wrapping_add(ctx.instruction_size()).into();
            match ctx.op0 {
                Some(op0) if op0 != expected_op0 => return Err(Error::CantWriteReturnPc),
                Some(_) => {}
                None => {
                    ctx.op0 = Some(expected_op0);
                    ctx.flags.insert(StepContextFlags::OP0_DEDUCED);
                }
            }

            // `dst` must be asserted to `fp`.
            let expected_dst: Value = vm.cpu.fp.into();
            match ctx.dst {
                Some(dst) if dst != expected_dst => return Err(Error::CantWriteReturnFp),
                Some(_) => {}
                None => {
                    ctx.dst = Some(expected_dst);
                    ctx.flags.insert(StepContextFlags::DST_DEDUCED);
                }
            }
        }
        OpCode::AssertEq => {
            let res_logic = ctx.instruction.result_logic()?;

            if let Some(dst) = ctx.dst {
                if ctx.op1.is_none() {
                    if let Some(op1) = deduce_op1_from_op0(res_logic, ctx.op0, &dst)? {
                        ctx.op1 = Some(op1);
                        ctx.flags.insert(StepContextFlags::OP1_DEDUCED);
                    }
                }

                if ctx.op0.is_none() {
                    if let Some(op1) = ctx.op1 {
                        if let Some(op0) = deduce_op0_from_op1(res_logic, &op1, &dst)? {
                            ctx.op0 = Some(op0);
                            ctx.flags.insert(StepContextFlags::OP0_DEDUCED);
                        }
                    }
                }
            }
        }
        OpCode::None | OpCode::Ret => {}
    }

    Ok(())
}

/// Attempts to deduce the value of `op1` given a result logic and the values of `op0` and `dst`.
fn deduce_op1_from_op0(
    res_logic: ResultLogic,
    op0: Option<Value>,
    dst: &Value,
) -> Result<Option<Value>, Error> {
    match res_logic {
        ResultLogic::Op1 => Ok(Some(*dst)),
        ResultLogic::Add => match op0 {
            //     dst = op0 + op1
            // =>  op1 = dst - op0
            Some(op0) => Ok(Some(dst.subtract(&op0)?)),
            None => Ok(None),
        },
        ResultLogic::Mul => match op0 {
            //     dst = op0 * op1
            // =>  op1 = dst / op0
            Some(op0) => Ok(Some(dst.divide(&op0)?)),
            None => Ok(None),
        },
        ResultLogic::Unconstrained => Ok(None),
    }
}

/// Attempts to deduce the value of `op0` given a result logic and the values of `op1` and `dst`.
fn deduce_op0_from_op1(
    res_logic: ResultLogic,
    op1: &Value,
    dst: &Value,
) -> Result<Option<Value>, Error> {
    match res_logic {
        ResultLogic::Op1 => Ok(None),
        //     dst = op0 + op1
        // =>  op0 = dst - op1
        ResultLogic::Add => Ok(Some(dst.subtract(op1)?)),
        //     dst = op0 * op1
        // =>  op0 = dst / op1
        ResultLogic::Mul => Ok(Some(dst.divide(op1)?)),
        ResultLogic::Unconstrained => Ok(None),
    }
}

/// Computes the `res` value of an instruction from its result logic and operands, if possible.
fn compute_res(ctx: &mut StepContext) -> Result<(), Error> {
    ctx.res = match ctx.instruction.result_logic()? {
        ResultLogic::Unconstrained => None,
        ResultLogic::Op1 => ctx.op1,
        ResultLogic::Add => match (ctx.op0, ctx.op1) {
            (Some(op0), Some(op1)) => Some(op0.add(&op1)?),
            _ => None,
        },
        ResultLogic::Mul => match (ctx.op0, ctx.op1) {
            (Some(op0), Some(op1)) => Some(op0.multiply(&op1)?),
            _ => None,
        },
    };
    Ok(())
}

/// Enforces the assertions an `AssertEq` instruction makes: `dst` must equal `res`.
///
/// This does not itself write to memory (that happens uniformly in [`commit_operands`]); it
/// only settles `ctx.dst` to `res` when `dst` was not already known, letting the write-once
/// memory catch any contradiction when the value is finally committed.
fn apply_op_code_assertions(ctx: &mut StepContext) -> Result<(), Error> {
    if matches!(ctx.instruction.op_code()?, OpCode::AssertEq) {
        let res = ctx.res.ok_or(Error::UnconstrainedResAssertEq)?;
        if ctx.dst.is_none() {
            ctx.dst = Some(res);
            ctx.flags.insert(StepContextFlags::DST_DEDUCED);
        }
    }

    Ok(())
}

/// Writes every operand value that ended up known (whether read from memory, deduced from a
/// builtin, or deduced from the opcode) back into the write-once memory.
///
/// Because [`Memory::assert_eq`] is idempotent on matching values and rejects conflicting ones,
/// this single pass both persists freshly-deduced values and enforces consistency for values
/// that were already present.
fn commit_operands(ctx: &mut StepContext, vm: &mut CairoVM) -> Result<(), Error> {
    if let Some(dst) = ctx.dst {
        vm.memory.assert_eq(ctx.dst_addr, dst.as_value_ref())?;
    }
    if let Some(op0) = ctx.op0 {
        vm.memory.assert_eq(ctx.op0_addr, op0.as_value_ref())?;
    }
    if let Some(op1) = ctx.op1 {
        vm.memory.assert_eq(ctx.op1_addr, op1.as_value_ref())?;
    }
    Ok(())
}

/// Folds this step's three re-centered instruction offsets into the running `rc_limits` bound.
fn update_rc_limits(ctx: &mut StepContext, vm: &mut CairoVM) {
    let offsets = [
        ctx.instruction.dst_offset(),
        ctx.instruction.op0_offset(),
        ctx.instruction.op1_offset(),
    ];

    for offset in offsets {
        // Re-center the signed, unbiased offset back into `[0, 2^16)`: this recovers the
        // original bit pattern the instruction word encodes (spec.md §4.2's biasing is its own
        // inverse under this transform).
        let recentered = (offset as i32 + 0x8000) as u16;
        vm.rc_limits = Some(match vm.rc_limits {
            None => (recentered, recentered),
            Some((min, max)) => (min.min(recentered), max.max(recentered)),
        });
    }
}

/// Updates the CPU's registers after a step has fully executed, in FP → AP → PC order
/// (spec.md §4.7): `fp` may depend on `dst`, `ap` may depend on `res`, and `pc` may depend on
/// either, so later updates must never read a register that an earlier update already
/// overwrote in a way the instruction did not intend.
fn update_registers(ctx: &StepContext, vm: &mut CairoVM) -> Result<(), Error> {
    let op_code = ctx.instruction.op_code()?;

    // --- FP ---
    vm.cpu.fp = match op_code.fp_update() {
        FpUpdate::Regular => vm.cpu.fp,
        FpUpdate::ApPlus2 => vm.cpu.ap.wrapping_add(2),
        FpUpdate::Dst => match ctx.dst {
            Some(Value::Pointer(p)) => p,
            _ => return Err(Error::ExpectedRelocatable(ctx.dst_addr)),
        },
    };

    // --- AP ---
    vm.cpu.ap = match ctx.instruction.ap_update()? {
        ApUpdate::Regular => vm.cpu.ap,
        ApUpdate::Add => {
            let res = ctx.res.ok_or(Error::ApUpdateAddResUnconstrained)?;
            match res {
                Value::Scalar(s) => vm.cpu.ap.checked_add_felt(&s)?,
                Value::Pointer(p) => p,
            }
        }
        ApUpdate::Add1 => vm.cpu.ap.wrapping_add(1),
        ApUpdate::Add2 => vm.cpu.ap.wrapping_add(2),
    };

    // --- PC ---
    vm.cpu.pc = match ctx.instruction.pc_update()? {
        PcUpdate::Regular => vm.cpu.pc.wrapping_add(ctx.instruction_size()),
        PcUpdate::AbsoluteJump => match ctx.res {
            Some(Value::Pointer(p)) => p,
            _ => return Err(Error::JumpNotRelocatable),
        },
        PcUpdate::RelativeJump => match ctx.res {
            Some(Value::Scalar(s)) => vm.cpu.pc.checked_add_felt(&s)?,
            _ => return Err(Error::JumpRelNotInt),
        },
        PcUpdate::ConditionalJump => {
            let dst_is_zero = matches!(ctx.dst, Some(Value::Scalar(s)) if s == Felt::ZERO);
            if dst_is_zero {
                vm.cpu.pc.wrapping_add(ctx.instruction_size())
            } else {
                match ctx.op1 {
                    Some(Value::Scalar(s)) => vm.cpu.pc.checked_add_felt(&s)?,
                    _ => return Err(Error::JnzNotInt),
                }
            }
        }
    };

    Ok(())
}

impl Value {
    /// Borrows this value as a [`ValueRef`], for writing into memory.
    fn as_value_ref(&self) -> ValueRef {
        match self {
            Value::Scalar(s) => ValueRef::Scalar(s),
            Value::Pointer(p) => ValueRef::Pointer(p),
        }
    }
}

bitflags! {
    /// Some flags associated with a [`StepContext`].
    #[derive(Clone, Copy)]
    struct StepContextFlags: u8 {
        /// Whether the destination of the instruction was deduced from the opcode rather than
        /// read directly from memory.
        const DST_DEDUCED = 1 << 0;
        /// Whether the first operand of the instruction was deduced (by a builtin or the
        /// opcode) rather than read directly from memory.
        const OP0_DEDUCED = 1 << 2;
        /// Whether the second operand of the instruction was deduced (by a builtin or the
        /// opcode) rather than read directly from memory.
        const OP1_DEDUCED = 1 << 4;
        /// The instruction has a size of two cells instead of one (it carries an immediate).
        const SIZE_TWO = 1 << 7;
    }
}

/// Stores a state that must be kept around while decoding and executing an instruction.
struct StepContext {
    /// The instruction being decoded.
    pub instruction: Instruction,
    /// The destination address of the instruction being decoded.
    pub dst_addr: Pointer,
    /// The value of the destination of the instruction being decoded, if known.
    pub dst: Option<Value>,
    /// The address of the first operand of the instruction being decoded.
    pub op0_addr: Pointer,
    /// The value of the first operand of the instruction being decoded, if known.
    pub op0: Option<Value>,
    /// The address of the second operand of the instruction being decoded.
    pub op1_addr: Pointer,
    /// The value of the second operand of the instruction being decoded, if known.
    pub op1: Option<Value>,
    /// The computed result of the instruction, if constrained.
    pub res: Option<Value>,
    /// Some flags associated with the context.
    pub flags: StepContextFlags,
}

impl StepContext {
    /// Creates a new [`StepContext`] with the provided instruction.
    ///
    /// All other fields are initialized to dummy values and are properly set while the
    /// instruction is being executed.
    #[inline]
    fn new(instruction: Instruction) -> Self {
        let zero = Pointer::real(0, 0);
        Self {
            instruction,
            dst_addr: zero,
            dst: None,
            op0_addr: zero,
            op0: None,
            op1_addr: zero,
            op1: None,
            res: None,
            flags: StepContextFlags::empty(),
        }
    }

    /// Returns the size of the instruction in memory cells: two if it carries an immediate,
    /// one otherwise.
    #[inline(always)]
    fn instruction_size(&self) -> usize {
        if self.flags.contains(StepContextFlags::SIZE_TWO) {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinManager;
    use crate::trace::NoopTrace;

    /// `dst_reg=AP, off_dst=0, op1_src=Imm, off_op1=1, res_logic=Op1, ap_update=Add1,
    /// opcode=AssertEq`: `[ap] = <imm>; ap++`.
    fn assert_eq_imm_word() -> u64 {
        let off_dst = 0x8000u64;
        let off_op0 = 0x8000u64;
        let off_op1 = 0x8000u64 + 1;
        let flags = 0 // dst_reg = AP
            | (0 << 1) // op0_reg = AP
            | (1 << 2) // op1_src = Imm
            | (0 << 5) // res_logic = Op1
            | (0 << 7) // pc_update = Regular
            | (2 << 10) // ap_update = Add1
            | (4 << 12); // opcode = AssertEq
        off_dst | (off_op0 << 16) | (off_op1 << 32) | (flags << 48)
    }

    /// `dst_reg=AP, off_dst=0, op0_reg=AP, off_op0=1, op1_src=AP, off_op1=2, res_logic=Add,
    /// pc_update=Regular, ap_update=Regular, opcode=AssertEq`: `[ap] = [ap+1] + [ap+2]`.
    fn assert_eq_add_word() -> u64 {
        let off_dst = 0x8000u64;
        let off_op0 = 0x8000u64 + 1;
        let off_op1 = 0x8000u64 + 2;
        let flags = 0 // dst_reg = AP
            | (0 << 1) // op0_reg = AP
            | (4 << 2) // op1_src = AP
            | (1 << 5) // res_logic = Add
            | (0 << 7) // pc_update = Regular
            | (0 << 10) // ap_update = Regular
            | (4 << 12); // opcode = AssertEq
        off_dst | (off_op0 << 16) | (off_op1 << 32) | (flags << 48)
    }

    /// `dst_reg=AP, off_dst=-1, op1_src=Imm, off_op1=1, res_logic=Op1,
    /// pc_update=ConditionalJump, opcode=None`: `jmp rel <imm> if [ap-1] != 0`.
    fn jnz_imm_word() -> u64 {
        let off_dst = 0x8000u64 - 1;
        let off_op0 = 0x8000u64;
        let off_op1 = 0x8000u64 + 1;
        let flags = 0 // dst_reg = AP
            | (0 << 1) // op0_reg = AP
            | (1 << 2) // op1_src = Imm
            | (0 << 5) // res_logic = Op1
            | (4 << 7) // pc_update = ConditionalJump
            | (0 << 10) // ap_update = Regular
            | (0 << 12); // opcode = None
        off_dst | (off_op0 << 16) | (off_op1 << 32) | (flags << 48)
    }

    fn blank_vm() -> CairoVM {
        let mut memory = Memory::new();
        let base = memory.add_segment();
        let cpu = Cpu {
            pc: base,
            ap: base,
            fp: base,
        };
        CairoVM::new(cpu, memory, BuiltinManager::new())
    }

    #[test]
    fn assert_eq_with_immediate_writes_dst_and_advances_ap() {
        let mut vm = blank_vm();
        let pc = vm.cpu.pc;
        let ap = vm.cpu.ap;
        vm.memory_mut()
            .assert_eq(pc, ValueRef::Scalar(&Felt::from(assert_eq_imm_word())))
            .unwrap();
        vm.memory_mut()
            .assert_eq(pc.wrapping_add(1), ValueRef::Scalar(&Felt::from(5u64)))
            .unwrap();

        let mut trace = NoopTrace;
        vm.step(&mut trace).unwrap();

        assert_eq!(vm.memory().get(ap).unwrap().unwrap().scalar().copied(), Some(Felt::from(5u64)));
        assert_eq!(vm.cpu().ap, ap.wrapping_add(1));
        assert_eq!(vm.cpu().pc, pc.wrapping_add(2));
        assert_eq!(vm.step_count(), 1);
    }

    #[test]
    fn assert_eq_add_deduces_missing_operand() {
        let mut vm = blank_vm();
        let pc = vm.cpu.pc;
        let ap = vm.cpu.ap;

        vm.memory_mut()
            .assert_eq(pc, ValueRef::Scalar(&Felt::from(assert_eq_add_word())))
            .unwrap();
        // [ap+1] = 3 is known; [ap] (dst) is left unknown so it must be deduced as op0 + op1.
        vm.memory_mut()
            .assert_eq(ap.wrapping_add(2), ValueRef::Scalar(&Felt::from(3u64)))
            .unwrap();
        vm.memory_mut()
            .assert_eq(ap.wrapping_add(1), ValueRef::Scalar(&Felt::from(4u64)))
            .unwrap();

        let mut trace = NoopTrace;
        vm.step(&mut trace).unwrap();

        assert_eq!(vm.memory().get(ap).unwrap().unwrap().scalar().copied(), Some(Felt::from(7u64)));
    }

    #[test]
    fn conditional_jump_follows_the_branch_when_dst_is_nonzero() {
        let mut vm = blank_vm();
        let pc = vm.cpu.pc;
        let ap = vm.cpu.ap;

        vm.memory_mut()
            .assert_eq(pc, ValueRef::Scalar(&Felt::from(jnz_imm_word())))
            .unwrap();
        vm.memory_mut()
            .assert_eq(pc.wrapping_add(1), ValueRef::Scalar(&Felt::from(10u64)))
            .unwrap();
        vm.memory_mut()
            .assert_eq(ap.wrapping_sub(1), ValueRef::Scalar(&Felt::from(1u64)))
            .unwrap();

        let mut trace = NoopTrace;
        vm.step(&mut trace).unwrap();

        assert_eq!(vm.cpu().pc, pc.wrapping_add(10));
        assert_eq!(vm.cpu().ap, ap);
    }

    #[test]
    fn fetching_past_the_end_of_the_program_fails() {
        let mut vm = blank_vm();
        let mut trace = NoopTrace;
        assert!(matches!(vm.step(&mut trace), Err(Error::ProgramCounterLost(_))));
    }

    #[test]
    fn rc_limits_track_the_widest_offsets_seen() {
        let mut vm = blank_vm();
        let pc = vm.cpu.pc;
        vm.memory_mut()
            .assert_eq(pc, ValueRef::Scalar(&Felt::from(assert_eq_imm_word())))
            .unwrap();
        vm.memory_mut()
            .assert_eq(pc.wrapping_add(1), ValueRef::Scalar(&Felt::from(5u64)))
            .unwrap();

        assert_eq!(vm.rc_limits(), None);
        let mut trace = NoopTrace;
        vm.step(&mut trace).unwrap();
        // off_dst = off_op0 = 0, off_op1 = 1: re-centered as 0x8000 and 0x8001.
        assert_eq!(vm.rc_limits(), Some((0x8000, 0x8001)));
    }
}
