//! Defines the [`Program`] type: the already-validated program image the core receives from its
//! parsing collaborator (spec.md §6 "Program image (input)", Non-goals: "Program file parsing
//! (JSON deserialization)").
//!
//! Only the fields the execution core actually reads are modeled here: `data`, `identifiers`
//! (to resolve the entrypoint when `main` is absent), `builtins`, `main`, and `hints`.
//! `reference_manager`, `constants` and error-message ranges are carried through opaquely for
//! downstream collaborators (debugging tools, error formatting) but never interpreted by the
//! core itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use starknet_types_core::felt::Felt;

/// A compiled Cairo program, as produced by the (out of scope) program-file parser.
///
/// Deserialized directly from the Cairo compiler's JSON output; see the reference cairo-vm's
/// `deserialize_program.rs` for the wire shape this mirrors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    /// The program's bytecode, as a flat sequence of field elements (instructions and their
    /// immediates, read verbatim into the program segment at startup).
    pub data: Vec<Felt>,
    /// Named identifiers exported by the program, keyed by their fully qualified name (e.g.
    /// `__main__.main`). Used to resolve the entrypoint when `main` is not set directly.
    #[serde(default)]
    pub identifiers: HashMap<String, Identifier>,
    /// The builtins this program declares, in the order it declares them.
    #[serde(default)]
    pub builtins: Vec<String>,
    /// The offset of the program's main entrypoint within `data`, if already resolved by the
    /// parsing collaborator.
    #[serde(default)]
    pub main: Option<usize>,
    /// Opaque reference-manager data, passed through unmodified for debugging/tracing tools.
    #[serde(default)]
    pub reference_manager: serde_json::Value,
    /// Hints to run before the instruction at each given `data` offset, keyed by that offset.
    ///
    /// The core never interprets the contents of a [`HintParams`]; it only locates the hints due
    /// to run at the current `pc` and hands them to the hint processor callback unchanged
    /// (spec.md §6 "Hint processor").
    #[serde(default)]
    pub hints: HashMap<usize, Vec<HintParams>>,
    /// Named constants exported by the program, passed through to hint processors that need
    /// them.
    #[serde(default)]
    pub constants: HashMap<String, Felt>,
    /// Ranges of `pc` offsets with an associated human-readable error message, used only for
    /// formatting error reports; never consulted by the core's control flow.
    #[serde(default)]
    pub error_message_ranges: Vec<ErrorMessageRange>,
}

impl Program {
    /// Resolves the program's entrypoint offset: `main` if already set, otherwise the `pc` of
    /// whichever identifier looks like a `main` function (spec.md §4.10 "resolve main offset
    /// from program").
    pub fn main_offset(&self) -> Option<usize> {
        if let Some(main) = self.main {
            return Some(main);
        }

        self.identifiers
            .iter()
            .find(|(name, id)| {
                id.type_.as_deref() == Some("function")
                    && (name.ends_with("::main") || name.ends_with(".main"))
            })
            .and_then(|(_, id)| id.pc)
    }
}

/// A single named identifier exported by a [`Program`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identifier {
    /// The offset within the program's `data` this identifier points to, if it is a
    /// code-carrying identifier (e.g. a function or label).
    #[serde(default)]
    pub pc: Option<usize>,
    /// The kind of identifier this is (`"function"`, `"label"`, `"const"`, ...).
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
}

/// Opaque hint metadata attached to a single `pc` offset.
///
/// The core only ever reads `code` far enough to hand it to the hint processor; everything else
/// is scope/flow-tracking bookkeeping the hint processor collaborator interprets on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintParams {
    /// The hint's source code, in whatever language the hint processor understands.
    pub code: String,
    /// The variable scopes visible to this hint, passed through unmodified.
    #[serde(default)]
    pub accessible_scopes: Vec<String>,
    /// Opaque ap-tracking/flow-tracking metadata, passed through unmodified.
    #[serde(default)]
    pub flow_tracking_data: serde_json::Value,
}

/// A range of `pc` offsets sharing a single custom error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessageRange {
    /// The first `pc` offset, inclusive, this message applies to.
    pub start_pc: usize,
    /// The last `pc` offset, exclusive, this message applies to.
    pub stop_pc: usize,
    /// The human-readable message to surface for failures within this range.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_offset_prefers_explicit_main() {
        let program = Program {
            main: Some(7),
            ..Default::default()
        };
        assert_eq!(program.main_offset(), Some(7));
    }

    #[test]
    fn main_offset_falls_back_to_identifiers() {
        let mut program = Program::default();
        program.identifiers.insert(
            "__main__.main".to_owned(),
            Identifier {
                pc: Some(3),
                type_: Some("function".to_owned()),
            },
        );
        assert_eq!(program.main_offset(), Some(3));
    }

    #[test]
    fn main_offset_ignores_non_function_identifiers() {
        let mut program = Program::default();
        program.identifiers.insert(
            "__main__.main".to_owned(),
            Identifier {
                pc: Some(3),
                type_: Some("label".to_owned()),
            },
        );
        assert_eq!(program.main_offset(), None);
    }
}
