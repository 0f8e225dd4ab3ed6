//! Defines the [`Memory`] type, responsible for representing the memory of a Cairo virtual
//! machine.
//!
//! # Immutable Memory
//!
//! Note that the memory of a Cairo virtual machine does not work in the same way regular computer
//! memory do. Instead, it is mathematically immutable, and every operation that would normally
//! mutate memory instead *asserts* a memory cell to a specific value. The value was previously
//! unknown, and now it is defined to a specific value. Any access to that memory cell must now
//! confirm its value is the same as the one it was asserted to.
//!
//! # Segments
//!
//! Each cell of the memory holds an element of a field (in this case, the Starknet field is
//! used). And the total size of the memory is the size of that field. Because it's not possible
//! to represent a field of that size in a regular computer's memory, the Cairo language requires
//! programs to split their memory into *segments*. Each segment is a contiguous block of memory
//! that is located *somewhere* in the virtual machine's address space. The final location of
//! segments is not decided until the program has finished running, meaning that a program can
//! never rely on the final location of a segment.
//!
//! # Temporary segments
//!
//! While running, builtins sometimes need to reserve a block of memory whose final location
//! cannot be known yet (most commonly: internal builtin bookkeeping segments). Cairo solves
//! this with *temporary segments*, addressed with a negative segment index (see
//! [`Pointer::is_temporary`]). A temporary segment is eventually *relocated* onto a real one
//! via a [relocation rule](Memory::add_relocation_rule) before the run finishes; any temporary
//! reference still unresolved at that point is an error.

mod pointer;
mod segment;
mod value;

use std::collections::HashMap;

use starknet_types_core::felt::Felt;

pub use self::pointer::*;
pub use self::segment::*;
pub use self::value::*;

use crate::error::Error;

/// A validation rule installed by a builtin, invoked every time a new value is asserted within
/// the segment it was registered for.
///
/// Grounded in the real cairo-vm's `add_validation_rule`/`validated_memory`, used by e.g. the
/// range-check builtin to reject out-of-bound values eagerly instead of only at finalization.
pub type ValidationRule = Box<dyn Fn(ValueRef) -> Result<(), Error> + Send + Sync>;

/// Represents the memory of the Cairo virtual machine.
///
/// More information on memory can be found in the [module-level documentation](self).
#[derive(Default)]
pub struct Memory {
    /// The real segments that have been allocated in the memory, indexed by segment index.
    segments: Vec<Segment>,
    /// The temporary segments that have been allocated in the memory, indexed by the magnitude
    /// used in [`Pointer::temporary`].
    temp_segments: Vec<Segment>,
    /// Relocation rules mapping a temporary segment index to the real address it resolves to.
    relocation_rules: HashMap<usize, Pointer>,
    /// Validation rules installed per real segment index.
    validation_rules: HashMap<usize, Vec<ValidationRule>>,
    /// Size overrides for real segments, set by builtins whose true size is not simply "highest
    /// cell written" (e.g. a builtin segment sized by its stop pointer).
    segment_sizes: HashMap<usize, usize>,
    /// For each real segment, the set of `(offset, page_id)` pairs that must be included in the
    /// program's public memory, as used when assembling the public input (spec.md §4.12).
    public_memory_offsets: HashMap<usize, Vec<(usize, usize)>>,
    /// Set once [`Memory::relocate`] has run; guards against relocating twice.
    relocated: bool,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("segments", &self.segments.len())
            .field("temp_segments", &self.temp_segments.len())
            .field("relocated", &self.relocated)
            .finish_non_exhaustive()
    }
}

impl Clone for Memory {
    fn clone(&self) -> Self {
        Self {
            segments: self.segments.clone(),
            temp_segments: self.temp_segments.clone(),
            relocation_rules: self.relocation_rules.clone(),
            validation_rules: HashMap::new(),
            segment_sizes: self.segment_sizes.clone(),
            public_memory_offsets: self.public_memory_offsets.clone(),
            relocated: self.relocated,
        }
    }
}

impl Memory {
    /// Creates an empty [`Memory`] with no segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new, empty real segment and returns a pointer to its first cell.
    pub fn add_segment(&mut self) -> Pointer {
        let index = self.segments.len();
        self.segments.push(Segment::new());
        log::trace!("allocated segment {index}");
        Pointer::real(index, 0)
    }

    /// Allocates a new, empty temporary segment and returns a pointer to its first cell.
    pub fn add_temporary_segment(&mut self) -> Pointer {
        let index = self.temp_segments.len();
        self.temp_segments.push(Segment::new());
        Pointer::temporary(index, 0)
    }

    /// Returns the number of real segments currently allocated.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns a [`Segment`] of the memory.
    ///
    /// # Safety
    ///
    /// The provided `segment` must have been allocated previously by this [`Memory`].
    #[inline(always)]
    pub unsafe fn segment_unchecked(&self, segment: usize) -> &Segment {
        unsafe { self.segments.get_unchecked(segment) }
    }

    /// Returns a mutable [`Segment`] of the memory.
    ///
    /// # Safety
    ///
    /// The provided `segment` must have been allocated previously by this [`Memory`].
    #[inline(always)]
    pub unsafe fn segment_unchecked_mut(&mut self, segment: usize) -> &mut Segment {
        unsafe { self.segments.get_unchecked_mut(segment) }
    }

    /// Resolves a [`Pointer`]'s segment to a [`Segment`] reference, real or temporary.
    fn segment(&self, segment: isize) -> Result<&Segment, Error> {
        if segment >= 0 {
            self.segments
                .get(segment as usize)
                .ok_or(Error::UnallocatedSegment(segment))
        } else {
            let index = (-segment - 1) as usize;
            self.temp_segments
                .get(index)
                .ok_or(Error::UnallocatedSegment(segment))
        }
    }

    /// Resolves a [`Pointer`]'s segment to a mutable [`Segment`] reference, real or temporary,
    /// allocating the segment if it does not exist yet (matching the teacher's amortized-growth
    /// philosophy: segments, like cells, grow lazily on first write).
    fn segment_mut(&mut self, segment: isize) -> &mut Segment {
        if segment >= 0 {
            let index = segment as usize;
            if index >= self.segments.len() {
                self.segments.resize_with(index + 1, Segment::new);
            }
            &mut self.segments[index]
        } else {
            let index = (-segment - 1) as usize;
            if index >= self.temp_segments.len() {
                self.temp_segments.resize_with(index + 1, Segment::new);
            }
            &mut self.temp_segments[index]
        }
    }

    /// Reads the value stored at `address`, if any, without marking it as accessed.
    pub fn get(&self, address: Pointer) -> Result<Option<ValueRef>, Error> {
        Ok(self.segment(address.segment)?.get(address.offset))
    }

    /// Reads the value stored at `address`, marking the cell as accessed if present.
    pub fn get_and_mark_accessed(&mut self, address: Pointer) -> Result<Option<ValueRef>, Error> {
        if address.segment >= 0 {
            let index = address.segment as usize;
            if index >= self.segments.len() {
                return Err(Error::UnallocatedSegment(address.segment));
            }
            Ok(self.segments[index].get_and_mark_accessed(address.offset))
        } else {
            let index = (-address.segment - 1) as usize;
            if index >= self.temp_segments.len() {
                return Err(Error::UnallocatedSegment(address.segment));
            }
            Ok(self.temp_segments[index].get_and_mark_accessed(address.offset))
        }
    }

    /// Reads the value stored at `address` as a field element (spec.md §3's typed `get_felt`),
    /// converting an unwritten cell to [`Error::UnknownMemoryCell`] and a relocatable value to
    /// [`Error::ExpectedInteger`].
    pub fn get_felt(&self, address: Pointer) -> Result<Felt, Error> {
        match self.get(address)? {
            Some(ValueRef::Scalar(value)) => Ok(*value),
            Some(ValueRef::Pointer(_)) => Err(Error::ExpectedInteger(address)),
            None => Err(Error::UnknownMemoryCell(address)),
        }
    }

    /// Reads the value stored at `address` as a relocatable pointer (spec.md §3's typed
    /// `get_relocatable`), converting an unwritten cell to [`Error::UnknownMemoryCell`] and a
    /// field element to [`Error::ExpectedRelocatable`].
    pub fn get_relocatable(&self, address: Pointer) -> Result<Pointer, Error> {
        match self.get(address)? {
            Some(ValueRef::Pointer(pointer)) => Ok(*pointer),
            Some(ValueRef::Scalar(_)) => Err(Error::ExpectedRelocatable(address)),
            None => Err(Error::UnknownMemoryCell(address)),
        }
    }

    /// Asserts that the memory cell at `address` holds `value`.
    ///
    /// Runs any [validation rule](Memory::add_validation_rule) installed for the segment right
    /// after a fresh write.
    pub fn assert_eq(&mut self, address: Pointer, value: ValueRef) -> Result<(), Error> {
        let was_known = self.segment(address.segment).ok().map(|s| s.get(address.offset).is_some()).unwrap_or(false);

        self.segment_mut(address.segment)
            .assert_eq(address.offset, value)
            .map_err(|err| match err {
                Error::Contradiction(_) => Error::Contradiction(address),
                other => other,
            })?;

        if !was_known && address.segment >= 0 {
            if let Some(rules) = self.validation_rules.get(&(address.segment as usize)) {
                for rule in rules {
                    rule(value)?;
                }
            }
        }

        Ok(())
    }

    /// Installs a validation rule on a real segment, run automatically on every first write to
    /// a cell of that segment.
    pub fn add_validation_rule(&mut self, segment: usize, rule: ValidationRule) {
        self.validation_rules.entry(segment).or_default().push(rule);
    }

    /// Registers a relocation rule: every reference to `src` (a temporary-segment address with
    /// a zero offset) is to be replaced by `dst` once [`Memory::relocate`] runs.
    pub fn add_relocation_rule(&mut self, src: Pointer, dst: Pointer) -> Result<(), Error> {
        if !src.is_temporary() {
            return Err(Error::AddressNotInTemporarySegment(src));
        }
        if src.offset != 0 {
            return Err(Error::NonZeroOffset(src));
        }
        let index = src.temporary_index().unwrap();
        if self.relocation_rules.contains_key(&index) {
            return Err(Error::DuplicatedRelocation(src));
        }
        self.relocation_rules.insert(index, dst);
        Ok(())
    }

    /// Forces the effective size of a real segment, overriding the size that would otherwise be
    /// computed from the highest cell written to it.
    pub fn set_segment_size(&mut self, segment: usize, size: usize) {
        self.segment_sizes.insert(segment, size);
        if segment < self.segments.len() {
            self.segments[segment].set_forced_size(size);
        }
    }

    /// Records that the cell at `(segment, offset)` must be part of the public memory, tagged
    /// with the given page id (`0` for the main page).
    pub fn add_public_memory_offset(&mut self, segment: usize, offset: usize, page: usize) {
        self.public_memory_offsets
            .entry(segment)
            .or_default()
            .push((offset, page));
    }

    /// Returns the recorded public memory offsets, keyed by real segment index.
    pub fn public_memory_offsets(&self) -> &HashMap<usize, Vec<(usize, usize)>> {
        &self.public_memory_offsets
    }

    /// Returns the effective size (see [`Segment::effective_size`]) of every real segment.
    pub fn compute_effective_sizes(&self) -> Vec<usize> {
        self.segments.iter().map(Segment::effective_size).collect()
    }

    /// Returns the total number of memory holes (never-written cells within a segment's
    /// effective size) across all real segments.
    ///
    /// Used by provers for cost accounting; not load-bearing for execution itself.
    pub fn get_memory_holes(&self) -> usize {
        self.segments.iter().map(Segment::memory_holes).sum()
    }

    /// Marks every cell in `[address, address + len)` as accessed in one call, instead of
    /// reading each cell individually through [`Memory::get_and_mark_accessed`].
    ///
    /// Gated on `run_finished` (spec.md §3's "Access tracking": `mark_address_range_as_accessed`
    /// is only meaningful once the run has produced a final, stable picture of which cells
    /// exist — calling it mid-run would race the CPU's own per-step marking).
    pub fn mark_address_range_as_accessed(
        &mut self,
        address: Pointer,
        len: usize,
        run_finished: bool,
    ) -> Result<(), Error> {
        if !run_finished {
            return Err(Error::RunNotFinished);
        }
        if address.segment < 0 {
            return Err(Error::UnallocatedSegment(address.segment));
        }
        let index = address.segment as usize;
        self.segments
            .get_mut(index)
            .ok_or(Error::UnallocatedSegment(address.segment))?
            .mark_range_accessed(address.offset, len);
        Ok(())
    }

    /// Computes the base address of every real segment, following the convention that address
    /// `0` is never handed out (`base[0] = 1`) so that `0` can unambiguously mean "no pointer"
    /// in the public input and prover-facing artifacts.
    pub fn relocate_segments(&self) -> Vec<usize> {
        let sizes = self.compute_effective_sizes();
        let mut bases = Vec::with_capacity(sizes.len());
        let mut next = 1usize;
        for size in sizes {
            bases.push(next);
            next += size;
        }
        bases
    }

    /// Resolves a temporary pointer through the registered relocation rules until a real
    /// pointer (or an unresolved temporary one, which is an error) is reached.
    fn resolve_temporary(&self, mut p: Pointer) -> Result<Pointer, Error> {
        // Bounded by the number of temporary segments: a well-formed relocation table cannot
        // contain a longer chain than that.
        for _ in 0..=self.temp_segments.len() {
            let Some(index) = p.temporary_index() else {
                return Ok(p);
            };
            let Some(target) = self.relocation_rules.get(&index) else {
                return Err(Error::UnresolvedTemporaryAddress(p));
            };
            p = target.wrapping_add(p.offset);
        }
        Err(Error::UnresolvedTemporaryAddress(p))
    }

    /// Flattens a [`Value`] into a single [`Felt`], given the base address of every real
    /// segment, resolving temporary references through the relocation table first.
    fn relocate_value(&self, value: Value, bases: &[usize]) -> Result<Felt, Error> {
        match value {
            Value::Scalar(s) => Ok(s),
            Value::Pointer(p) => Ok(Felt::from(self.relocate_pointer(p, bases)?)),
        }
    }

    /// Flattens a single [`Pointer`] into its linear address, given the base address of every
    /// real segment, resolving a temporary reference through the relocation table first.
    ///
    /// Used by the public-input builder (spec.md §4.12) to turn a builtin's base/stop-pointer
    /// addresses into the flat addresses the prover expects.
    pub fn relocate_pointer(&self, p: Pointer, bases: &[usize]) -> Result<usize, Error> {
        let p = if p.is_temporary() {
            self.resolve_temporary(p)?
        } else {
            p
        };
        let base = *bases
            .get(p.segment as usize)
            .ok_or(Error::UnallocatedSegment(p.segment))?;
        Ok(base + p.offset)
    }

    /// Relocates the whole memory into a single flat, linear address space.
    ///
    /// Returns a vector indexed by address (`relocated[0]` is always `None`, matching the
    /// `base[0] = 1` convention: address `0` never corresponds to a real cell). Can only be
    /// called once.
    pub fn relocate(&mut self) -> Result<Vec<Option<Felt>>, Error> {
        if self.relocated {
            return Err(Error::AlreadyRelocated);
        }

        let bases = self.relocate_segments();
        let total = bases
            .iter()
            .zip(self.compute_effective_sizes())
            .map(|(base, size)| base + size)
            .max()
            .unwrap_or(1);

        let mut flat = vec![None; total];
        for (segment_index, segment) in self.segments.iter().enumerate() {
            let base = bases[segment_index];
            for offset in 0..segment.highest_known_cell() {
                if let Some(value) = segment.get(offset) {
                    flat[base + offset] = Some(self.relocate_value(value.copied(), &bases)?);
                }
            }
        }

        // Move the content of every relocated temporary segment into the real segment its
        // rule targets, by concatenation (spec.md §4.1 "moves temporary-segment cells into real
        // segments by concatenation"). A temporary segment with no rule is only an error if some
        // value actually references it (checked above via `relocate_value`); one that is simply
        // never referenced and never ruled just carries no data forward.
        for (index, segment) in self.temp_segments.iter().enumerate() {
            let Some(target) = self.relocation_rules.get(&index) else {
                continue;
            };
            let target_base = *bases
                .get(target.segment as usize)
                .ok_or(Error::UnallocatedSegment(target.segment))?;
            for offset in 0..segment.highest_known_cell() {
                if let Some(value) = segment.get(offset) {
                    let flat_index = target_base + target.offset + offset;
                    if flat_index >= flat.len() {
                        flat.resize(flat_index + 1, None);
                    }
                    flat[flat_index] = Some(self.relocate_value(value.copied(), &bases)?);
                }
            }
        }

        self.relocated = true;
        log::debug!(
            "relocated {} segments into {total} linear addresses",
            self.segments.len()
        );
        Ok(flat)
    }

    /// Returns whether [`Memory::relocate`] has already run.
    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    /// Returns whether any temporary segment has ever been allocated.
    ///
    /// Used by [`crate::secure_run::verify_secure_run`] to short-circuit its temporary-address
    /// sweep: if no temporary segment was ever allocated, no value anywhere in memory can
    /// possibly reference one (spec.md §4.11).
    pub fn has_temporary_data(&self) -> bool {
        !self.temp_segments.is_empty()
    }

    /// Invokes `f` with every [`Pointer`] value stored anywhere in the real segments of memory.
    ///
    /// Stops and propagates the first error `f` returns.
    pub fn for_each_reachable_pointer<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(Pointer) -> Result<(), Error>,
    {
        for segment in &self.segments {
            for offset in 0..segment.highest_known_cell() {
                if let Some(ValueRef::Pointer(p)) = segment.get(offset) {
                    f(*p)?;
                }
            }
        }
        Ok(())
    }

    /// Writes a slice of field elements into a real segment starting at `address`, as whole
    /// scalar values. Used to load a program's bytecode into its segment.
    pub fn load_data(&mut self, address: Pointer, data: &[Felt]) -> Result<Pointer, Error> {
        let mut cursor = address;
        for value in data {
            self.assert_eq(cursor, ValueRef::Scalar(value))?;
            cursor = cursor.wrapping_add(1);
        }
        Ok(cursor)
    }

    /// Writes an argument to the execution stack starting at `address`, following the
    /// `CairoArg` convention used to seed entrypoint arguments: a scalar or pointer writes a
    /// single cell, while a composed/array argument is first flattened into its own segment and
    /// the resulting pointer is written at `address` instead.
    ///
    /// Grounded in the reference `MemorySegmentManager::gen_cairo_arg`/`write_arg`.
    pub fn write_arg(&mut self, address: Pointer, arg: &CairoArg) -> Result<Pointer, Error> {
        match arg {
            CairoArg::Single(value) => {
                self.assert_eq(address, value.as_ref())?;
                Ok(address.wrapping_add(1))
            }
            CairoArg::Array(values) => {
                let segment_start = self.add_segment();
                let mut cursor = segment_start;
                for value in values {
                    self.assert_eq(cursor, value.as_ref())?;
                    cursor = cursor.wrapping_add(1);
                }
                self.assert_eq(address, ValueRef::Pointer(&segment_start))?;
                Ok(address.wrapping_add(1))
            }
            CairoArg::Composed(args) => {
                let mut cursor = address;
                for nested in args {
                    cursor = self.write_arg(cursor, nested)?;
                }
                Ok(cursor)
            }
        }
    }
}

/// A structured argument written to the execution stack when starting a run, mirroring the
/// reference cairo-vm's `CairoArg`.
#[derive(Debug, Clone)]
pub enum CairoArg {
    /// A single scalar or pointer value, written directly to the stack.
    Single(Value),
    /// A flat array of values, written to their own segment; the stack only receives the
    /// pointer to that segment.
    Array(Vec<Value>),
    /// Several arguments written back to back, e.g. the fields of a builtin's initial stack
    /// entry.
    Composed(Vec<CairoArg>),
}

impl Value {
    fn as_ref(&self) -> ValueRef {
        match self {
            Value::Scalar(s) => ValueRef::Scalar(s),
            Value::Pointer(p) => ValueRef::Pointer(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocates_two_segments_back_to_back() {
        let mut memory = Memory::new();
        let seg0 = memory.add_segment();
        let seg1 = memory.add_segment();
        memory.assert_eq(seg0, ValueRef::Scalar(&Felt::from(1u64))).unwrap();
        memory.assert_eq(seg0.wrapping_add(1), ValueRef::Scalar(&Felt::from(2u64))).unwrap();
        memory.assert_eq(seg1, ValueRef::Scalar(&Felt::from(3u64))).unwrap();

        let bases = memory.relocate_segments();
        assert_eq!(bases, vec![1, 3]);

        let flat = memory.relocate().unwrap();
        assert_eq!(flat[0], None);
        assert_eq!(flat[1], Some(Felt::from(1u64)));
        assert_eq!(flat[2], Some(Felt::from(2u64)));
        assert_eq!(flat[3], Some(Felt::from(3u64)));
    }

    #[test]
    fn relocating_twice_is_an_error() {
        let mut memory = Memory::new();
        memory.add_segment();
        memory.relocate().unwrap();
        assert!(matches!(memory.relocate(), Err(Error::AlreadyRelocated)));
    }

    #[test]
    fn pointer_values_relocate_into_flat_addresses() {
        let mut memory = Memory::new();
        let seg0 = memory.add_segment();
        let seg1 = memory.add_segment();
        memory
            .assert_eq(seg0, ValueRef::Pointer(&seg1))
            .unwrap();

        let flat = memory.relocate().unwrap();
        // seg0 base = 1, seg1 base = 1 (seg0 is empty save for this one pointer cell... wait
        // seg0 has one cell written, so seg1 base = 1 + 1 = 2).
        assert_eq!(flat[1], Some(Felt::from(2u64)));
    }

    #[test]
    fn unresolved_temporary_pointer_fails_relocation() {
        let mut memory = Memory::new();
        memory.add_segment();
        let temp = memory.add_temporary_segment();
        memory.assert_eq(temp, ValueRef::Scalar(&Felt::from(7u64))).unwrap();
        memory
            .assert_eq(
                Pointer::real(0, 0),
                ValueRef::Pointer(&temp),
            )
            .unwrap();

        assert!(memory.relocate().is_err());
    }

    #[test]
    fn relocation_rule_concatenates_temporary_segment_data_into_the_target() {
        let mut memory = Memory::new();
        let real = memory.add_segment();
        memory.assert_eq(real, ValueRef::Scalar(&Felt::from(9u64))).unwrap();
        let temp = memory.add_temporary_segment();
        memory.assert_eq(temp, ValueRef::Scalar(&Felt::from(10u64))).unwrap();
        memory.assert_eq(temp.wrapping_add(1), ValueRef::Scalar(&Felt::from(11u64))).unwrap();

        // Concatenate the temporary segment right after the one cell already in `real`.
        memory.add_relocation_rule(temp, real.wrapping_add(1)).unwrap();

        let flat = memory.relocate().unwrap();
        assert_eq!(flat[1], Some(Felt::from(9u64)));
        assert_eq!(flat[2], Some(Felt::from(10u64)));
        assert_eq!(flat[3], Some(Felt::from(11u64)));
    }

    #[test]
    fn memory_holes_count_never_written_cells_within_effective_size() {
        let mut memory = Memory::new();
        let base = memory.add_segment();
        memory.assert_eq(base, ValueRef::Scalar(&Felt::from(1u64))).unwrap();
        memory.assert_eq(base.wrapping_add(2), ValueRef::Scalar(&Felt::from(3u64))).unwrap();

        assert_eq!(memory.compute_effective_sizes(), vec![3]);
        assert_eq!(memory.get_memory_holes(), 1);
    }

    #[test]
    fn mark_address_range_as_accessed_requires_the_run_to_have_finished() {
        let mut memory = Memory::new();
        let base = memory.add_segment();
        memory.assert_eq(base, ValueRef::Scalar(&Felt::from(1u64))).unwrap();
        memory.assert_eq(base.wrapping_add(1), ValueRef::Scalar(&Felt::from(2u64))).unwrap();

        assert!(matches!(
            memory.mark_address_range_as_accessed(base, 2, false),
            Err(Error::RunNotFinished)
        ));

        memory.mark_address_range_as_accessed(base, 2, true).unwrap();
        unsafe {
            assert_eq!(memory.segment_unchecked(0).accessed_cells(), 2);
        }
    }

    #[test]
    fn get_felt_and_get_relocatable_enforce_their_expected_tag() {
        let mut memory = Memory::new();
        let base = memory.add_segment();
        memory.assert_eq(base, ValueRef::Scalar(&Felt::from(5u64))).unwrap();
        memory
            .assert_eq(base.wrapping_add(1), ValueRef::Pointer(&base))
            .unwrap();

        assert_eq!(memory.get_felt(base).unwrap(), Felt::from(5u64));
        assert!(matches!(
            memory.get_felt(base.wrapping_add(1)),
            Err(Error::ExpectedInteger(_))
        ));
        assert_eq!(memory.get_relocatable(base.wrapping_add(1)).unwrap(), base);
        assert!(matches!(
            memory.get_relocatable(base),
            Err(Error::ExpectedRelocatable(_))
        ));
        assert!(matches!(
            memory.get_felt(base.wrapping_add(2)),
            Err(Error::UnknownMemoryCell(_))
        ));
    }

    #[test]
    fn writing_conflicting_values_to_the_same_cell_is_an_error() {
        let mut memory = Memory::new();
        let base = memory.add_segment();
        memory.assert_eq(base, ValueRef::Scalar(&Felt::from(1u64))).unwrap();
        assert!(memory.assert_eq(base, ValueRef::Scalar(&Felt::from(2u64))).is_err());
        // Re-asserting the same value is idempotent, not an error.
        assert!(memory.assert_eq(base, ValueRef::Scalar(&Felt::from(1u64))).is_ok());
    }
}
