//! Defines the [`Error`] type of the crate.

use thiserror::Error;

use crate::memory::Pointer;

/// An error that might occur when executing a Cairo program.
///
/// Variants are grouped by the phase of execution that raises them: decoding, memory,
/// arithmetic, instruction execution, the runner lifecycle, the secure-run sweep, and trace
/// handling.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // --- Decode errors ---
    /// The high bit of an encoded instruction word was set, which is never valid.
    #[error("the high bit of the instruction word must be zero")]
    NonZeroHighBit,
    /// The source of the second operand did not match any of the defined bit patterns.
    #[error("undefined op1 source in instruction flags")]
    UndefinedOp1Source,
    /// The result logic did not match any of the defined bit patterns.
    #[error("undefined result logic in instruction flags")]
    UndefinedResultLogic,
    /// The program counter update rule did not match any of the defined bit patterns.
    #[error("undefined pc update rule in instruction flags")]
    UndefinedPcUpdate,
    /// The allocation pointer update rule did not match any of the defined bit patterns.
    #[error("undefined ap update rule in instruction flags")]
    UndefinedApUpdate,
    /// The OP code did not match any of the defined bit patterns.
    #[error("undefined opcode in instruction flags")]
    UndefinedOpCode,
    /// A memory cell expected to hold an instruction held a value too large to fit in 64 bits.
    #[error("the program counter references a memory cell that is not a valid instruction")]
    UndefinedInstruction,

    // --- Memory errors ---
    /// A read targeted a memory cell that has never been written to.
    #[error("unknown memory cell at {0:?}")]
    UnknownMemoryCell(Pointer),
    /// A read expected a field element but found a relocatable value.
    #[error("expected an integer at {0:?}, found a relocatable value")]
    ExpectedInteger(Pointer),
    /// A read expected a relocatable value but found a field element.
    #[error("expected a relocatable value at {0:?}, found an integer")]
    ExpectedRelocatable(Pointer),
    /// A write attempted to assert a memory cell to a value that differs from the one it
    /// already holds.
    #[error("inconsistent memory at {0:?}")]
    Contradiction(Pointer),
    /// An access referenced a segment that has not been allocated.
    #[error("segment {0} has not been allocated")]
    UnallocatedSegment(isize),
    /// Too many cells would need to be allocated to satisfy a write.
    #[error("not enough physical memory to represent the running program's memory")]
    OutOfMemory,
    /// A relocation rule was added for an address that already has one.
    #[error("duplicated relocation rule for {0:?}")]
    DuplicatedRelocation(Pointer),
    /// A relocation rule's source address was not within a temporary segment.
    #[error("relocation source {0:?} is not within a temporary segment")]
    AddressNotInTemporarySegment(Pointer),
    /// A relocation rule's source address did not have a zero offset.
    #[error("relocation source {0:?} must have a zero offset")]
    NonZeroOffset(Pointer),
    /// A temporary reference remained in memory after relocation was applied.
    #[error("temporary address {0:?} was not resolved by any relocation rule")]
    UnresolvedTemporaryAddress(Pointer),
    /// Memory relocation was attempted more than once.
    #[error("memory has already been relocated")]
    AlreadyRelocated,

    // --- Math errors ---
    /// Attempted to add two relocatable values together.
    #[error("cannot add two relocatable values")]
    AddRelocatableToRelocatable,
    /// Attempted to multiply a relocatable value.
    #[error("cannot multiply a relocatable value")]
    MulRelocatable,
    /// Attempted to subtract two relocatables that do not share a segment.
    #[error("cannot subtract relocatables from different segments ({0:?} and {1:?})")]
    IncoherentProvenance(Pointer, Pointer),
    /// A pointer offset would under/overflow the machine integer used to represent it.
    #[error("pointer arithmetic overflowed the offset of {0:?}")]
    PointerTooLarge(Pointer),
    /// Attempted to divide by a pointer, or divide a pointer.
    #[error("cannot divide a relocatable value, or divide by one")]
    DividePointer,
    /// Attempted to divide by zero.
    #[error("division by zero")]
    DivideByZero,

    // --- Execution errors ---
    /// In immediate mode, the second operand's offset must be exactly one.
    #[error("in immediate mode, the op1 offset must be 1")]
    ImmShouldBe1,
    /// Double dereference through `op0` was attempted before `op0` was known.
    #[error("op0 must be known to use it as the base of op1")]
    UnknownOp0,
    /// The first operand of an instruction could not be computed by any known means.
    #[error("failed to compute op0")]
    FailedToComputeOp0,
    /// The second operand of an instruction could not be computed by any known means.
    #[error("failed to compute op1")]
    FailedToComputeOp1,
    /// The destination of an instruction could not be computed by any known means.
    #[error("failed to compute dst")]
    NoDst,
    /// An `AssertEq` instruction had no constrained result to assert `dst` against.
    #[error("result is unconstrained in an assert-eq instruction")]
    UnconstrainedResAssertEq,
    /// A `Call` instruction's `op0` did not equal `pc + instruction size`.
    #[error("a call instruction cannot write a return pc other than pc + instruction size")]
    CantWriteReturnPc,
    /// A `Call` instruction's `dst` did not equal `fp`.
    #[error("a call instruction cannot write a return fp other than fp")]
    CantWriteReturnFp,
    /// An `ap_update = Add` instruction had no constrained result to add.
    #[error("ap update rule Add requires a constrained result")]
    ApUpdateAddResUnconstrained,
    /// A `pc_update = Jump` instruction's result was not a relocatable value.
    #[error("jump target must be a relocatable value")]
    JumpNotRelocatable,
    /// A `pc_update = JumpRel` instruction's result was not a field element.
    #[error("relative jump offset must be a field element")]
    JumpRelNotInt,
    /// A `pc_update = Jnz` instruction's second operand was not a field element.
    #[error("conditional jump offset must be a field element")]
    JnzNotInt,
    /// The step limit given to the runner was exceeded.
    #[error("exceeded the maximum of {0} steps")]
    StepLimitExceeded(usize),
    /// A builtin failed to run correctly because of invalid input.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    // --- Runner/lifecycle errors ---
    /// The program being run does not define a `main` entrypoint.
    #[error("the program does not define a main entrypoint")]
    NoMain,
    /// The program segment was never initialized.
    #[error("the program segment has not been initialized")]
    NoProgramBase,
    /// The execution segment was never initialized.
    #[error("the execution segment has not been initialized")]
    NoExecutionBase,
    /// A layout required a builtin that the program did not declare.
    #[error("missing builtin `{0}` required by the selected layout")]
    MissingBuiltin(&'static str),
    /// The program declared builtins out of the canonical order required by the layout.
    #[error("builtins are not in the canonical order required by the layout")]
    DisorderedBuiltins,
    /// A builtin's final stack pointer did not match its expected location.
    #[error("invalid stop pointer for builtin `{0}`")]
    InvalidStopPointer(&'static str),
    /// The program counter referenced a cell outside of any allocated segment.
    #[error("program counter lost: no instruction at {0:?}")]
    ProgramCounterLost(Pointer),
    /// `mark_address_range_as_accessed` was called before the run finished.
    #[error("cannot mark an address range as accessed before the run has finished")]
    RunNotFinished,

    // --- Security errors ---
    /// A builtin segment was accessed beyond the bounds implied by its stop pointer.
    #[error("out of bounds access to the `{0}` builtin segment")]
    OutOfBoundsBuiltinSegmentAccess(&'static str),
    /// The program segment was accessed beyond the bounds of the program data.
    #[error("out of bounds access to the program segment")]
    OutOfBoundsProgramSegmentAccess,
    /// A reachable value still referenced a temporary segment after relocation.
    #[error("invalid memory address after relocation: {0:?}")]
    InvalidMemoryAddress(Pointer),

    // --- Trace errors ---
    /// The trace has already been relocated.
    #[error("trace has already been relocated")]
    TraceAlreadyRelocated,
    /// Tracing was not enabled for this run.
    #[error("tracing is not enabled for this run")]
    TraceNotEnabled,
    /// An operation required a relocated trace, but the trace has not been relocated yet.
    #[error("trace has not been relocated yet")]
    TraceNotRelocated,

    // --- Public input errors ---
    /// The relocated trace was too short to derive entry/exit addresses.
    #[error("trace must contain at least two entries")]
    EmptyTrace,
    /// A public memory address had no corresponding value in the relocated memory.
    #[error("no memory found for public address {0}")]
    MemoryNotFound(usize),
}

/// Errors raised specifically by [`Builtin`](crate::builtin::Builtin) implementations.
///
/// Kept distinct from [`Error`] so that a builtin runner only needs to depend on this narrow
/// surface instead of the whole execution-error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// The builtin could not deduce the value of the requested memory cell.
    #[error("builtin could not deduce a value for this memory cell")]
    CannotDeduce,
    /// The builtin's input was malformed in a way that violates its soundness invariants.
    #[error("builtin input failed a soundness check: {0}")]
    InvalidInput(String),
    /// The builtin's final stack could not be read from the execution stack.
    #[error("failed to read the final stack for builtin `{0}`")]
    FinalStack(&'static str),
}
