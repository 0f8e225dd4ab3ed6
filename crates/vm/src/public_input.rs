//! Builds the [`PublicInput`] handed to the prover and verifier (spec.md §4.12, §6).
//!
//! Grounded in the reference cairo-vm's `air_public_input` module: the same three pieces of
//! information — the segment address map, the range-check limits, and the public memory list —
//! re-expressed over this crate's already-relocated [`Memory`] and [`VecTrace`] instead of a
//! `CairoRunner`.

use std::collections::HashMap;

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use starknet_types_core::felt::Felt;

use crate::builtin::{Builtin, BuiltinManager};
use crate::error::Error;
use crate::memory::Memory;
use crate::trace::RelocatedTraceEntry;

/// The `{begin_addr, stop_ptr}` pair recorded for a named memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    pub begin_addr: usize,
    pub stop_ptr: usize,
}

/// A single entry of the public memory list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicMemoryEntry {
    pub address: usize,
    pub page: usize,
    #[serde(serialize_with = "serialize_hex_option", deserialize_with = "deserialize_hex_option")]
    pub value: Option<Felt>,
}

/// The full public-input artifact produced at the end of a run (spec.md §4.12, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicInput {
    pub layout: String,
    pub rc_min: i64,
    pub rc_max: i64,
    pub n_steps: usize,
    pub memory_segments: HashMap<String, SegmentRange>,
    pub public_memory: Vec<PublicMemoryEntry>,
}

/// Builds the [`PublicInput`] for a finished run.
///
/// `relocated_memory` and `relocated_trace` must already have gone through
/// [`Memory::relocate`]/[`crate::trace::VecTrace::relocate`]. `rc_limits` is the
/// `(min, max)` pair accumulated over the run (spec.md §3), still in the unsigned,
/// biased representation the instruction words actually carry; this builder re-centers
/// it back into the signed range the public input reports.
pub fn build_public_input(
    layout: &str,
    memory: &Memory,
    relocated_memory: &[Option<Felt>],
    relocated_trace: &[RelocatedTraceEntry],
    rc_limits: Option<(u16, u16)>,
    builtins: &BuiltinManager,
    bases: &[usize],
) -> Result<PublicInput, Error> {
    let (first, last) = match relocated_trace {
        [] | [_] => return Err(Error::EmptyTrace),
        [first, .., last] => (first, last),
    };

    let mut memory_segments = HashMap::with_capacity(builtins.len() + 2);
    memory_segments.insert(
        "program".to_owned(),
        SegmentRange {
            begin_addr: felt_to_addr(first.pc)?,
            stop_ptr: felt_to_addr(last.pc)?,
        },
    );
    memory_segments.insert(
        "execution".to_owned(),
        SegmentRange {
            begin_addr: felt_to_addr(first.ap)?,
            stop_ptr: felt_to_addr(last.ap)?,
        },
    );
    for builtin in builtins.iter() {
        let begin_addr = memory.relocate_pointer(builtin.base(), bases)?;
        let stop_ptr = match builtin.stop_ptr() {
            Some(stop_ptr) => memory.relocate_pointer(stop_ptr, bases)?,
            None => begin_addr,
        };
        memory_segments.insert(builtin.name().to_owned(), SegmentRange { begin_addr, stop_ptr });
    }

    let mut public_memory = Vec::new();
    for (&segment, offsets) in memory.public_memory_offsets() {
        let base = *bases.get(segment).ok_or(Error::UnallocatedSegment(segment as isize))?;
        for &(offset, page) in offsets {
            let address = base + offset;
            let value = relocated_memory
                .get(address)
                .copied()
                .ok_or(Error::MemoryNotFound(address))?;
            public_memory.push(PublicMemoryEntry { address, page, value });
        }
    }
    public_memory.sort_by_key(|entry| entry.address);

    let (rc_min, rc_max) = match rc_limits {
        Some((min, max)) => (recenter(min), recenter(max)),
        None => (0, 0),
    };

    Ok(PublicInput {
        layout: layout.to_owned(),
        rc_min,
        rc_max,
        n_steps: relocated_trace.len(),
        memory_segments,
        public_memory,
    })
}

/// Recenters a biased (originally unsigned) offset back into the signed range the public input
/// reports, the inverse of [`crate::instr::Instruction::unbias`]'s inverse used by `update_rc_limits`.
fn recenter(biased: u16) -> i64 {
    biased as i64 - 0x8000
}

fn felt_to_addr(value: Felt) -> Result<usize, Error> {
    value.to_usize().ok_or(Error::MemoryNotFound(0))
}

fn hex_of(value: &Felt) -> String {
    let bytes = value.to_bytes_be();
    let digits: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0x0".to_owned()
    } else {
        format!("0x{trimmed}")
    }
}

fn serialize_hex_option<S>(value: &Option<Felt>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(felt) => serializer.serialize_str(&hex_of(felt)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_hex_option<'de, D>(deserializer: D) -> Result<Option<Felt>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;

    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => {
            let s = s.strip_prefix("0x").unwrap_or(&s);
            Felt::from_hex(&format!("0x{s}"))
                .map(Some)
                .map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinManager;
    use crate::memory::Memory;

    #[test]
    fn rejects_trace_shorter_than_two_entries() {
        let memory = Memory::new();
        let relocated = Vec::new();
        let err = build_public_input(
            "plain",
            &memory,
            &relocated,
            &[],
            None,
            &BuiltinManager::new(),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::EmptyTrace));
    }

    #[test]
    fn builds_program_and_execution_segments_from_trace_ends() {
        let memory = Memory::new();
        let trace = [
            RelocatedTraceEntry { pc: Felt::from(1u64), ap: Felt::from(10u64), fp: Felt::from(10u64) },
            RelocatedTraceEntry { pc: Felt::from(5u64), ap: Felt::from(20u64), fp: Felt::from(10u64) },
        ];
        let input = build_public_input(
            "plain",
            &memory,
            &[],
            &trace,
            Some((0x7000, 0x9000)),
            &BuiltinManager::new(),
            &[],
        )
        .unwrap();

        assert_eq!(
            input.memory_segments["program"],
            SegmentRange { begin_addr: 1, stop_ptr: 5 }
        );
        assert_eq!(
            input.memory_segments["execution"],
            SegmentRange { begin_addr: 10, stop_ptr: 20 }
        );
        assert_eq!(input.rc_min, 0x7000 - 0x8000);
        assert_eq!(input.rc_max, 0x9000 - 0x8000);
        assert_eq!(input.n_steps, 2);
    }

    #[test]
    fn hex_encodes_public_memory_values_without_leading_zeros() {
        assert_eq!(hex_of(&Felt::from(0u64)), "0x0");
        assert_eq!(hex_of(&Felt::from(0x1au64)), "0x1a");
    }
}
