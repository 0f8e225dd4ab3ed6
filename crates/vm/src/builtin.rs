//! Defines the [`Builtin`] trait and the closed [`BuiltinKind`] dispatch enum used to run
//! built-in pre-defined functions during execution.
//!
//! # Why a closed enum instead of `Box<dyn Builtin>`
//!
//! Every step of the virtual machine potentially consults whichever builtin owns the segment
//! `op0`/`op1` falls into (spec.md §4.6). That lookup sits squarely in the hot loop, so this
//! crate dispatches over a closed [`BuiltinKind`] enum rather than a trait object: the compiler
//! can inline and devirtualize each arm, and there is a fixed, known set of builtins a Cairo
//! layout can ever declare (spec.md's own Design Notes call this out explicitly).

use std::collections::HashMap;

use starknet_types_core::felt::Felt;

use crate::error::{Error, RunnerError};
use crate::memory::{Memory, Pointer, Value, ValueRef};

/// The behavior every builtin runner must implement.
///
/// Mirrors the contract of the reference cairo-vm's `BuiltinRunner` trait, trimmed to what
/// spec.md §4.6 actually asks the execution core to drive: segment initialization, automatic
/// memory-cell deduction, and final-stack validation. Internal bookkeeping specific to a given
/// builtin (how Pedersen hashing or EC operations are actually computed) is explicitly out of
/// scope (spec.md Non-goals) and is not part of this trait.
pub trait Builtin {
    /// The name of the builtin, as it appears in a program's `builtins` list.
    fn name(&self) -> &'static str;

    /// The number of memory cells that make up a single "instance" of this builtin (e.g. 3 for
    /// range-check: one input, two bound-check helpers are derived from it, not stored).
    fn cells_per_instance(&self) -> usize;

    /// The base address of the segment this builtin was assigned, once allocated.
    fn base(&self) -> Pointer;

    /// Allocates this builtin's segment within `memory` and records its base address.
    fn initialize_segment(&mut self, memory: &mut Memory);

    /// Installs any validation rules this builtin requires on its own segment (spec.md §4.6
    /// "deduction/validation"). The default implementation installs none.
    fn install_validation_rules(&self, _memory: &mut Memory) {}

    /// Attempts to deduce the value of a memory cell within this builtin's segment.
    ///
    /// Returns `Ok(None)` if the builtin has no opinion about this cell (the most common case:
    /// most builtin cells are *inputs*, supplied by the program, not *outputs* the builtin
    /// derives), `Ok(Some(value))` if it successfully deduced one, or `Err(_)` if the inputs
    /// already present violate the builtin's soundness invariants.
    fn deduce_memory_cell(
        &self,
        address: Pointer,
        memory: &Memory,
    ) -> Result<Option<Value>, RunnerError>;

    /// Validates and consumes this builtin's final stack pointer, returning the address just
    /// past it (spec.md §4.10 "end run").
    ///
    /// `stack_top` is the address, within the execution segment, one past the last builtin
    /// pointer pushed onto the stack; reading backwards from there yields each builtin's stop
    /// pointer in reverse declaration order.
    fn final_stack(&mut self, memory: &Memory, stack_top: Pointer) -> Result<Pointer, Error>;

    /// Returns the stop pointer recorded by [`Builtin::final_stack`], once it has run.
    fn stop_ptr(&self) -> Option<Pointer>;

    /// Returns the number of cells within this builtin's segment that have actually been
    /// written to, used both for cost accounting and for the default `get_used_instances`.
    fn get_used_cells(&self, memory: &Memory) -> Result<usize, Error>;

    /// Runs whatever segment-specific security checks this builtin requires beyond the generic
    /// bounds checks already performed by [`crate::secure_run::verify_secure_run`].
    fn run_security_checks(&self, _memory: &Memory) -> Result<(), Error> {
        Ok(())
    }
}

/// The range-check builtin.
///
/// The only builtin given a full, behaviorally faithful implementation in this crate (the
/// others are non-goals per spec.md); grounded in the reference `RangeCheckBuiltinRunner`
/// (`other_examples/…range_check.rs`). Tracks its own segment's value usage via
/// [`RangeCheckBuiltin::get_range_check_usage`], distinct from the public input's
/// `rc_min`/`rc_max` (spec.md §4.12), which bound re-centered instruction offsets instead.
#[derive(Debug, Clone)]
pub struct RangeCheckBuiltin {
    base: Option<Pointer>,
    stop_ptr: Option<Pointer>,
}

impl RangeCheckBuiltin {
    /// Creates a new, unallocated range-check builtin.
    pub fn new() -> Self {
        Self {
            base: None,
            stop_ptr: None,
        }
    }

    /// The inclusive upper bound every input must stay under: `2^128`.
    fn bound() -> Felt {
        Felt::TWO.pow(128u16)
    }

    /// Computes the minimum and maximum value written to the range-check segment.
    ///
    /// Distinct from spec.md §4.12's `rc_min`/`rc_max` public-input fields, which bound
    /// re-centered instruction offsets over the whole run (`CairoVM::rc_limits`) rather than
    /// values written to this builtin's segment. This is the builtin's own usage bookkeeping,
    /// kept for parity with the reference runner rather than fed into the public input.
    ///
    /// The reference `RangeCheckBuiltinRunner::get_range_check_usage` additionally splits every
    /// input on 16-bit boundaries (`RANGE_CHECK_N_PARTS` sub-limbs) before taking the bound;
    /// this crate tracks the bound over whole input values instead, which is sufficient since
    /// every value here is already known to sit in `[0, 2^128)` by `install_validation_rules`.
    pub fn get_range_check_usage(&self, memory: &Memory) -> Option<(Felt, Felt)> {
        let base = self.base?;

        let segment_len = {
            // SAFETY: `base` was allocated by `initialize_segment` before this is ever called.
            unsafe { memory.segment_unchecked(base.segment as usize) }.highest_known_cell()
        };

        let mut bounds: Option<(Felt, Felt)> = None;
        for offset in 0..segment_len {
            let Ok(Some(ValueRef::Scalar(value))) = memory.get(base.wrapping_add(offset)) else {
                continue;
            };
            bounds = Some(match bounds {
                None => (*value, *value),
                Some((min, max)) => (
                    if *value < min { *value } else { min },
                    if *value > max { *value } else { max },
                ),
            });
        }
        bounds
    }
}

impl Default for RangeCheckBuiltin {
    fn default() -> Self {
        Self::new()
    }
}

impl Builtin for RangeCheckBuiltin {
    fn name(&self) -> &'static str {
        "range_check"
    }

    fn cells_per_instance(&self) -> usize {
        1
    }

    fn base(&self) -> Pointer {
        self.base.expect("range-check segment not initialized")
    }

    fn initialize_segment(&mut self, memory: &mut Memory) {
        self.base = Some(memory.add_segment());
    }

    fn install_validation_rules(&self, memory: &mut Memory) {
        let bound = Self::bound();
        let segment = self.base().segment as usize;
        memory.add_validation_rule(
            segment,
            Box::new(move |value| match value {
                ValueRef::Scalar(v) if *v < bound => Ok(()),
                ValueRef::Scalar(_) => Err(RunnerError::InvalidInput(
                    "range-check value out of bounds".to_owned(),
                )
                .into()),
                ValueRef::Pointer(_) => Err(RunnerError::InvalidInput(
                    "range-check cells must hold field elements".to_owned(),
                )
                .into()),
            }),
        );
    }

    fn deduce_memory_cell(
        &self,
        _address: Pointer,
        _memory: &Memory,
    ) -> Result<Option<Value>, RunnerError> {
        // Every range-check cell is an *input* supplied by the program; the builtin never
        // derives a value, only validates the ones it is given.
        Ok(None)
    }

    fn final_stack(&mut self, memory: &Memory, stack_top: Pointer) -> Result<Pointer, Error> {
        let stop_ptr_addr = stack_top.wrapping_sub(1);
        let Some(ValueRef::Pointer(stop_ptr)) = memory.get(stop_ptr_addr)? else {
            return Err(RunnerError::FinalStack(self.name()).into());
        };
        let stop_ptr = *stop_ptr;

        let used = self.get_used_cells(memory)?;
        if stop_ptr.segment != self.base().segment || stop_ptr.offset != used {
            return Err(Error::InvalidStopPointer(self.name()));
        }

        self.stop_ptr = Some(stop_ptr);
        Ok(stop_ptr_addr)
    }

    fn stop_ptr(&self) -> Option<Pointer> {
        self.stop_ptr
    }

    fn get_used_cells(&self, memory: &Memory) -> Result<usize, Error> {
        let base = self.base.ok_or(Error::NoProgramBase)?;
        // SAFETY: initialized before use.
        let segment = unsafe { memory.segment_unchecked(base.segment as usize) };
        Ok(segment.highest_known_cell())
    }
}

/// The output builtin: a plain, unvalidated scratch segment the program writes its outputs to.
#[derive(Debug, Clone, Default)]
pub struct OutputBuiltin {
    base: Option<Pointer>,
    stop_ptr: Option<Pointer>,
}

impl Builtin for OutputBuiltin {
    fn name(&self) -> &'static str {
        "output"
    }

    fn cells_per_instance(&self) -> usize {
        1
    }

    fn base(&self) -> Pointer {
        self.base.expect("output segment not initialized")
    }

    fn initialize_segment(&mut self, memory: &mut Memory) {
        self.base = Some(memory.add_segment());
    }

    fn deduce_memory_cell(
        &self,
        _address: Pointer,
        _memory: &Memory,
    ) -> Result<Option<Value>, RunnerError> {
        Ok(None)
    }

    fn final_stack(&mut self, memory: &Memory, stack_top: Pointer) -> Result<Pointer, Error> {
        let stop_ptr_addr = stack_top.wrapping_sub(1);
        let Some(ValueRef::Pointer(stop_ptr)) = memory.get(stop_ptr_addr)? else {
            return Err(RunnerError::FinalStack(self.name()).into());
        };
        if stop_ptr.segment != self.base().segment {
            return Err(Error::InvalidStopPointer(self.name()));
        }
        self.stop_ptr = Some(*stop_ptr);
        Ok(stop_ptr_addr)
    }

    fn stop_ptr(&self) -> Option<Pointer> {
        self.stop_ptr
    }

    fn get_used_cells(&self, memory: &Memory) -> Result<usize, Error> {
        let base = self.base.ok_or(Error::NoProgramBase)?;
        let segment = unsafe { memory.segment_unchecked(base.segment as usize) };
        Ok(segment.highest_known_cell())
    }
}

/// A minimal builtin runner for builtins whose internal semantics are out of scope (spec.md
/// Non-goals: "builtin internals... are not specified here") but whose segment bookkeeping
/// still has to participate in layout, final-stack validation, and relocation like any other
/// builtin.
#[derive(Debug, Clone)]
pub struct OpaqueBuiltin {
    name: &'static str,
    cells_per_instance: usize,
    base: Option<Pointer>,
    stop_ptr: Option<Pointer>,
}

impl OpaqueBuiltin {
    /// Creates a new opaque builtin with the given name and per-instance cell count.
    pub fn new(name: &'static str, cells_per_instance: usize) -> Self {
        Self {
            name,
            cells_per_instance,
            base: None,
            stop_ptr: None,
        }
    }
}

impl Builtin for OpaqueBuiltin {
    fn name(&self) -> &'static str {
        self.name
    }

    fn cells_per_instance(&self) -> usize {
        self.cells_per_instance
    }

    fn base(&self) -> Pointer {
        self.base.expect("builtin segment not initialized")
    }

    fn initialize_segment(&mut self, memory: &mut Memory) {
        self.base = Some(memory.add_segment());
    }

    fn deduce_memory_cell(
        &self,
        _address: Pointer,
        _memory: &Memory,
    ) -> Result<Option<Value>, RunnerError> {
        Ok(None)
    }

    fn final_stack(&mut self, memory: &Memory, stack_top: Pointer) -> Result<Pointer, Error> {
        let stop_ptr_addr = stack_top.wrapping_sub(1);
        let Some(ValueRef::Pointer(stop_ptr)) = memory.get(stop_ptr_addr)? else {
            return Err(RunnerError::FinalStack(self.name()).into());
        };
        if stop_ptr.segment != self.base().segment {
            return Err(Error::InvalidStopPointer(self.name()));
        }
        self.stop_ptr = Some(*stop_ptr);
        Ok(stop_ptr_addr)
    }

    fn stop_ptr(&self) -> Option<Pointer> {
        self.stop_ptr
    }

    fn get_used_cells(&self, memory: &Memory) -> Result<usize, Error> {
        let base = self.base.ok_or(Error::NoProgramBase)?;
        let segment = unsafe { memory.segment_unchecked(base.segment as usize) };
        Ok(segment.highest_known_cell())
    }
}

/// The closed set of builtins a Cairo layout can declare, matching the canonical ordering
/// layouts enforce (spec.md §4.10 / §6).
#[derive(Debug, Clone)]
pub enum BuiltinKind {
    /// `output`.
    Output(OutputBuiltin),
    /// `pedersen`.
    Pedersen(OpaqueBuiltin),
    /// `range_check`.
    RangeCheck(RangeCheckBuiltin),
    /// `ecdsa`.
    Ecdsa(OpaqueBuiltin),
    /// `bitwise`.
    Bitwise(OpaqueBuiltin),
    /// `ec_op`.
    EcOp(OpaqueBuiltin),
    /// `keccak`.
    Keccak(OpaqueBuiltin),
    /// `poseidon`.
    Poseidon(OpaqueBuiltin),
    /// `segment_arena`.
    SegmentArena(OpaqueBuiltin),
}

impl BuiltinKind {
    /// Constructs the builtin matching a layout's declared name, or `None` if the name is not
    /// one of the nine recognized builtins.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "output" => Self::Output(OutputBuiltin::default()),
            "pedersen" => Self::Pedersen(OpaqueBuiltin::new("pedersen", 3)),
            "range_check" => Self::RangeCheck(RangeCheckBuiltin::new()),
            "ecdsa" => Self::Ecdsa(OpaqueBuiltin::new("ecdsa", 2)),
            "bitwise" => Self::Bitwise(OpaqueBuiltin::new("bitwise", 5)),
            "ec_op" => Self::EcOp(OpaqueBuiltin::new("ec_op", 7)),
            "keccak" => Self::Keccak(OpaqueBuiltin::new("keccak", 16)),
            "poseidon" => Self::Poseidon(OpaqueBuiltin::new("poseidon", 6)),
            "segment_arena" => Self::SegmentArena(OpaqueBuiltin::new("segment_arena", 3)),
            _ => return None,
        })
    }

    /// The canonical declaration order for the standard layouts, used to validate that a
    /// program's `builtins` list is not out of order (spec.md §4.10 "disordered builtins").
    pub const CANONICAL_ORDER: &'static [&'static str] = &[
        "output",
        "pedersen",
        "range_check",
        "ecdsa",
        "bitwise",
        "ec_op",
        "keccak",
        "poseidon",
        "segment_arena",
    ];
}

macro_rules! dispatch {
    ($self:ident, $binding:ident => $body:expr) => {
        match $self {
            BuiltinKind::Output($binding) => $body,
            BuiltinKind::Pedersen($binding) => $body,
            BuiltinKind::RangeCheck($binding) => $body,
            BuiltinKind::Ecdsa($binding) => $body,
            BuiltinKind::Bitwise($binding) => $body,
            BuiltinKind::EcOp($binding) => $body,
            BuiltinKind::Keccak($binding) => $body,
            BuiltinKind::Poseidon($binding) => $body,
            BuiltinKind::SegmentArena($binding) => $body,
        }
    };
}

impl Builtin for BuiltinKind {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn cells_per_instance(&self) -> usize {
        dispatch!(self, b => b.cells_per_instance())
    }

    fn base(&self) -> Pointer {
        dispatch!(self, b => b.base())
    }

    fn initialize_segment(&mut self, memory: &mut Memory) {
        dispatch!(self, b => b.initialize_segment(memory))
    }

    fn install_validation_rules(&self, memory: &mut Memory) {
        dispatch!(self, b => b.install_validation_rules(memory))
    }

    fn deduce_memory_cell(
        &self,
        address: Pointer,
        memory: &Memory,
    ) -> Result<Option<Value>, RunnerError> {
        dispatch!(self, b => b.deduce_memory_cell(address, memory))
    }

    fn final_stack(&mut self, memory: &Memory, stack_top: Pointer) -> Result<Pointer, Error> {
        dispatch!(self, b => b.final_stack(memory, stack_top))
    }

    fn stop_ptr(&self) -> Option<Pointer> {
        dispatch!(self, b => b.stop_ptr())
    }

    fn get_used_cells(&self, memory: &Memory) -> Result<usize, Error> {
        dispatch!(self, b => b.get_used_cells(memory))
    }

    fn run_security_checks(&self, memory: &Memory) -> Result<(), Error> {
        dispatch!(self, b => b.run_security_checks(memory))
    }
}

/// Holds the set of builtins active for a run and routes per-segment operand deduction to
/// whichever builtin owns the segment in question (spec.md §4.6).
#[derive(Debug, Default)]
pub struct BuiltinManager {
    /// The builtins active for this run, in declaration order.
    builtins: Vec<BuiltinKind>,
    /// Maps a real segment index to the index of the builtin that owns it, for O(1) lookup on
    /// the per-step hot path.
    by_segment: HashMap<usize, usize>,
}

impl BuiltinManager {
    /// Creates an empty builtin manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a segment for `builtin` within `memory`, installs its validation rules, and
    /// registers it for operand-deduction dispatch.
    pub fn add(&mut self, mut builtin: BuiltinKind, memory: &mut Memory) {
        builtin.initialize_segment(memory);
        builtin.install_validation_rules(memory);
        let segment = builtin.base().segment as usize;
        log::debug!("allocated builtin `{}` at segment {segment}", builtin.name());
        self.by_segment.insert(segment, self.builtins.len());
        self.builtins.push(builtin);
    }

    /// Returns the builtin owning `segment`, if any.
    pub fn get(&self, segment: isize) -> Option<&BuiltinKind> {
        if segment < 0 {
            return None;
        }
        self.by_segment
            .get(&(segment as usize))
            .map(|&i| &self.builtins[i])
    }

    /// Returns every active builtin, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &BuiltinKind> {
        self.builtins.iter()
    }

    /// Returns every active builtin mutably, in declaration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BuiltinKind> {
        self.builtins.iter_mut()
    }

    /// Returns the number of active builtins.
    pub fn len(&self) -> usize {
        self.builtins.len()
    }

    /// Returns whether no builtin is active for this run.
    pub fn is_empty(&self) -> bool {
        self.builtins.is_empty()
    }

    /// Reads each builtin's final stop pointer off the execution stack, in reverse declaration
    /// order (spec.md §4.6 `final_stack`, §4.10 "end run").
    ///
    /// `stack_top` is the address one past the last builtin pointer on the initial stack; each
    /// call to [`Builtin::final_stack`] consumes one cell working backwards from there, so the
    /// builtins are popped in the opposite order they were pushed (the first builtin pushed is
    /// the last one popped). Returns the address one past the final (i.e. first-pushed)
    /// builtin's pointer, which is where the caller's own stack frame begins.
    pub fn final_stacks(&mut self, memory: &Memory, stack_top: Pointer) -> Result<Pointer, Error> {
        let mut cursor = stack_top;
        for builtin in self.builtins.iter_mut().rev() {
            cursor = builtin.final_stack(memory, cursor)?;
        }
        Ok(cursor)
    }

    /// Attempts to deduce the value of a memory cell using whichever builtin owns `address`'s
    /// segment.
    ///
    /// Returns `Ok(None)` if no builtin owns that segment at all (not an error: plenty of
    /// addresses in the program and execution segments are not builtin-owned), otherwise the
    /// result of that builtin's own deduction attempt.
    pub fn deduce(&self, address: Pointer, memory: &Memory) -> Result<Option<Value>, Error> {
        match self.get(address.segment) {
            Some(builtin) => builtin
                .deduce_memory_cell(address, memory)
                .map_err(Error::from),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_rejects_out_of_bound_values() {
        let mut memory = Memory::new();
        let mut manager = BuiltinManager::new();
        manager.add(BuiltinKind::from_name("range_check").unwrap(), &mut memory);
        let base = manager.get(0).unwrap().base();

        assert!(memory.assert_eq(base, ValueRef::Scalar(&Felt::from(5u64))).is_ok());
        let bound = Felt::TWO.pow(128u16);
        assert!(memory.assert_eq(base.wrapping_add(1), ValueRef::Scalar(&bound)).is_err());
    }

    #[test]
    fn manager_routes_deduction_only_to_the_owning_segment() {
        let mut memory = Memory::new();
        let mut manager = BuiltinManager::new();
        manager.add(BuiltinKind::from_name("output").unwrap(), &mut memory);
        let output_base = manager.get(0).unwrap().base();
        let unrelated = memory.add_segment();

        assert!(manager.deduce(output_base, &memory).unwrap().is_none());
        assert!(manager.deduce(unrelated, &memory).unwrap().is_none());
        assert!(manager.get(unrelated.segment).is_none());
    }

    #[test]
    fn final_stacks_pops_builtins_in_reverse_declaration_order() {
        let mut memory = Memory::new();
        let mut manager = BuiltinManager::new();
        manager.add(BuiltinKind::from_name("output").unwrap(), &mut memory);
        manager.add(BuiltinKind::from_name("range_check").unwrap(), &mut memory);

        let output_base = manager.get(0).unwrap().base();
        let range_check_base = manager.get(1).unwrap().base();

        let stack = memory.add_segment();
        memory.assert_eq(stack, ValueRef::Pointer(&output_base)).unwrap();
        memory
            .assert_eq(stack.wrapping_add(1), ValueRef::Pointer(&range_check_base))
            .unwrap();

        let below_frame = manager
            .final_stacks(&memory, stack.wrapping_add(2))
            .unwrap();

        assert_eq!(below_frame, stack);
        assert_eq!(manager.get(0).unwrap().stop_ptr(), Some(output_base));
        assert_eq!(manager.get(1).unwrap().stop_ptr(), Some(range_check_base));
    }

    #[test]
    fn canonical_order_lists_every_recognized_builtin() {
        for name in BuiltinKind::CANONICAL_ORDER {
            assert!(BuiltinKind::from_name(name).is_some());
        }
        assert!(BuiltinKind::from_name("not_a_builtin").is_none());
    }
}
