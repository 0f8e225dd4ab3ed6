//! Defines the [`HintProcessor`] trait: the opaque callback invoked once per step, before fetch
//! (spec.md §6 "Hint processor (collaborator callback)").
//!
//! Hint *processing* itself (parsing hint code, interpreting it, and the catalog of builtin
//! hints) is explicitly out of scope (spec.md Non-goals): the core only guarantees the contract
//! around the callback — exactly one invocation per step, at the step's `pc`, before the
//! instruction is fetched — and observes whatever effects the hint has on memory, registers, and
//! [`ExecutionScopes`] through the same write-once, typed-arithmetic machinery it uses itself.

use std::any::Any;
use std::collections::HashMap;

use starknet_types_core::felt::Felt;

use crate::error::Error;
use crate::program::HintParams;
use crate::CairoVM;

/// A stack of variable scopes a hint can read and write across steps.
///
/// Grounded in the reference cairo-vm's `ExecutionScopes`: a scope is a `HashMap<String, Any>`
/// bag a hint processor uses to carry state between hints (e.g. a dictionary tracker, a running
/// counter) that has no representation in Cairo memory itself.
#[derive(Default)]
pub struct ExecutionScopes {
    scopes: Vec<HashMap<String, Box<dyn Any>>>,
}

impl ExecutionScopes {
    /// Creates a new scope stack with a single, empty root scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    /// Pushes a new, empty scope onto the stack.
    pub fn enter_scope(&mut self, new_scope: HashMap<String, Box<dyn Any>>) {
        self.scopes.push(new_scope);
    }

    /// Pops the current scope off the stack.
    pub fn exit_scope(&mut self) -> Result<(), Error> {
        if self.scopes.len() <= 1 {
            return Err(Error::Runner(crate::error::RunnerError::InvalidInput(
                "cannot exit the root execution scope".to_owned(),
            )));
        }
        self.scopes.pop();
        Ok(())
    }

    /// Inserts a value into the current, innermost scope.
    pub fn insert_value<T: 'static>(&mut self, name: &str, value: T) {
        self.current_scope_mut()
            .insert(name.to_owned(), Box::new(value));
    }

    /// Returns a reference to a value in the current scope, if present and of the right type.
    pub fn get_ref<T: 'static>(&self, name: &str) -> Option<&T> {
        self.current_scope().get(name)?.downcast_ref::<T>()
    }

    /// Returns a mutable reference to a value in the current scope, if present and of the right
    /// type.
    pub fn get_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        self.current_scope_mut().get_mut(name)?.downcast_mut::<T>()
    }

    fn current_scope(&self) -> &HashMap<String, Box<dyn Any>> {
        self.scopes.last().expect("root scope is never popped")
    }

    fn current_scope_mut(&mut self) -> &mut HashMap<String, Box<dyn Any>> {
        self.scopes.last_mut().expect("root scope is never popped")
    }
}

impl std::fmt::Debug for ExecutionScopes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScopes")
            .field("depth", &self.scopes.len())
            .finish_non_exhaustive()
    }
}

/// The collaborator callback invoked once per step, before the instruction at the current `pc`
/// is fetched (spec.md §5 "Hint execution is invoked synchronously before each step").
///
/// A hint that mutates memory or registers does so through the very same [`CairoVM`] the step
/// engine itself uses, so it is bound by the same write-once and typed-arithmetic invariants;
/// any error it returns aborts the run exactly as if the step engine itself had failed.
pub trait HintProcessor {
    /// Executes every hint attached to the current `pc`, in declaration order.
    fn execute_hints(
        &mut self,
        vm: &mut CairoVM,
        exec_scopes: &mut ExecutionScopes,
        hints: &[HintParams],
        constants: &HashMap<String, Felt>,
    ) -> Result<(), Error>;
}

/// A [`HintProcessor`] that runs no hints, for programs that declare none or for secure-run-style
/// dry validation passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHintProcessor;

impl HintProcessor for NoopHintProcessor {
    fn execute_hints(
        &mut self,
        _vm: &mut CairoVM,
        _exec_scopes: &mut ExecutionScopes,
        _hints: &[HintParams],
        _constants: &HashMap<String, Felt>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_round_trip_values() {
        let mut scopes = ExecutionScopes::new();
        scopes.insert_value("counter", 41_i64);
        assert_eq!(scopes.get_ref::<i64>("counter"), Some(&41));
        *scopes.get_mut::<i64>("counter").unwrap() += 1;
        assert_eq!(scopes.get_ref::<i64>("counter"), Some(&42));
    }

    #[test]
    fn exiting_the_root_scope_fails() {
        let mut scopes = ExecutionScopes::new();
        assert!(scopes.exit_scope().is_err());
    }

    #[test]
    fn nested_scopes_shadow_independently() {
        let mut scopes = ExecutionScopes::new();
        scopes.insert_value("x", 1_i64);
        scopes.enter_scope(HashMap::new());
        scopes.insert_value("x", 2_i64);
        assert_eq!(scopes.get_ref::<i64>("x"), Some(&2));
        scopes.exit_scope().unwrap();
        assert_eq!(scopes.get_ref::<i64>("x"), Some(&1));
    }
}
