//! Defines the [`TraceEntry`] type and the machinery used to gather and relocate the execution
//! trace of a Cairo program (spec.md §3, §4.8).

use starknet_types_core::felt::Felt;

use crate::error::Error;
use crate::memory::{Memory, Pointer};

/// A single row of the execution trace: the value of every register right before a step was
/// executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// The value of the **Program Counter** before the step.
    pub pc: Pointer,
    /// The value of the **Allocation Pointer** before the step.
    pub ap: Pointer,
    /// The value of the **Frame Pointer** before the step.
    pub fp: Pointer,
}

/// A single row of the relocated trace: every register flattened to a single address in the
/// linear address space produced by [`Memory::relocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatedTraceEntry {
    /// The relocated value of the **Program Counter**.
    pub pc: Felt,
    /// The relocated value of the **Allocation Pointer**.
    pub ap: Felt,
    /// The relocated value of the **Frame Pointer**.
    pub fp: Felt,
}

/// A collection of callbacks to be called during the execution of a Cairo program.
///
/// The no-op [`NoopTrace`] implementation is used whenever the caller does not need an
/// execution trace (for instance, during the secure-run sanity pass spec.md §4.11 performs
/// before emitting a final artifact).
#[allow(unused_variables)]
pub trait Trace {
    /// Records a single row of the trace.
    fn push(&mut self, entry: TraceEntry);
}

/// An implementation of [`Trace`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrace;
impl Trace for NoopTrace {
    #[inline(always)]
    fn push(&mut self, _entry: TraceEntry) {}
}

/// A [`Trace`] implementation that records every entry in memory, for later relocation.
#[derive(Debug, Default, Clone)]
pub struct VecTrace {
    entries: Vec<TraceEntry>,
    relocated: Option<Vec<RelocatedTraceEntry>>,
}

impl VecTrace {
    /// Creates a new, empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unrelocated entries recorded so far.
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    /// Relocates every recorded entry using the segment base addresses produced by
    /// [`Memory::relocate_segments`].
    ///
    /// Requires at least one real segment's worth of bases (in practice: the relocation table
    /// must have at least two real segments, the program and execution segments, per spec.md
    /// §4.8's precondition); fails with [`Error::TraceAlreadyRelocated`] if already relocated,
    /// or [`Error::TraceNotEnabled`] if the relocation table is too short to have ever come from
    /// a real run (fewer than the program + execution segments every run allocates).
    pub fn relocate(&mut self, memory: &Memory) -> Result<(), Error> {
        if self.relocated.is_some() {
            return Err(Error::TraceAlreadyRelocated);
        }

        let bases = memory.relocate_segments();
        if bases.len() < 2 {
            return Err(Error::TraceNotEnabled);
        }
        let relocate_pointer = |p: Pointer| -> Result<Felt, Error> {
            let base = *bases
                .get(p.segment as usize)
                .ok_or(Error::UnallocatedSegment(p.segment))?;
            Ok(Felt::from(base + p.offset))
        };

        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            out.push(RelocatedTraceEntry {
                pc: relocate_pointer(entry.pc)?,
                ap: relocate_pointer(entry.ap)?,
                fp: relocate_pointer(entry.fp)?,
            });
        }

        self.relocated = Some(out);
        Ok(())
    }

    /// Returns the relocated entries, if [`VecTrace::relocate`] has already run.
    pub fn relocated(&self) -> Result<&[RelocatedTraceEntry], Error> {
        self.relocated
            .as_deref()
            .ok_or(Error::TraceNotRelocated)
    }
}

impl Trace for VecTrace {
    #[inline(always)]
    fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ValueRef;

    #[test]
    fn relocates_recorded_entries_using_segment_bases() {
        let mut memory = Memory::new();
        let program_base = memory.add_segment();
        let execution_base = memory.add_segment();
        memory
            .assert_eq(program_base, ValueRef::Scalar(&Felt::from(1u64)))
            .unwrap();

        let mut trace = VecTrace::new();
        trace.push(TraceEntry {
            pc: program_base,
            ap: execution_base,
            fp: execution_base,
        });

        trace.relocate(&memory).unwrap();
        let relocated = trace.relocated().unwrap();
        assert_eq!(relocated.len(), 1);
        // program segment has one cell, so its base is 1 and the execution segment's is 2.
        assert_eq!(relocated[0].pc, Felt::from(1u64));
        assert_eq!(relocated[0].ap, Felt::from(2u64));
        assert_eq!(relocated[0].fp, Felt::from(2u64));
    }

    #[test]
    fn relocating_twice_is_an_error() {
        let mut memory = Memory::new();
        memory.add_segment();
        memory.add_segment();

        let mut trace = VecTrace::new();
        trace.push(TraceEntry {
            pc: Pointer::real(0, 0),
            ap: Pointer::real(0, 0),
            fp: Pointer::real(0, 0),
        });

        trace.relocate(&memory).unwrap();
        assert!(matches!(trace.relocate(&memory), Err(Error::TraceAlreadyRelocated)));
    }

    #[test]
    fn reading_relocated_entries_before_relocating_is_an_error() {
        let trace = VecTrace::new();
        assert!(matches!(trace.relocated(), Err(Error::TraceNotRelocated)));
    }

    #[test]
    fn relocating_with_fewer_than_two_segments_is_an_error() {
        let mut memory = Memory::new();
        memory.add_segment();

        let mut trace = VecTrace::new();
        trace.push(TraceEntry {
            pc: Pointer::real(0, 0),
            ap: Pointer::real(0, 0),
            fp: Pointer::real(0, 0),
        });

        assert!(matches!(trace.relocate(&memory), Err(Error::TraceNotEnabled)));
    }
}
