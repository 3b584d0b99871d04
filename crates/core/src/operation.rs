//! The contract every schema operation fulfils.
//!
//! An operation has two faces: a pure state transition over the schema
//! snapshot `S`, and a physical effect issued through a [`SchemaEditor`].
//! The migration engine only ever talks to operations through this trait.

use std::fmt;

use crate::adapter::SchemaEditor;
use crate::error::Result;

pub trait Operation<S>: fmt::Debug + Send + Sync {
    /// Mutate `state` to reflect this operation. No I/O.
    fn state_forwards(&self, component: &str, state: &mut S);

    /// Physically apply the change, moving storage from `from` to `to`.
    fn database_forwards(
        &self,
        component: &str,
        editor: &mut dyn SchemaEditor,
        from: &S,
        to: &S,
    ) -> Result<()>;

    /// Physically revert the change. `from` is the post-operation state and
    /// `to` the pre-operation state.
    fn database_backwards(
        &self,
        component: &str,
        editor: &mut dyn SchemaEditor,
        from: &S,
        to: &S,
    ) -> Result<()>;

    fn reversible(&self) -> bool {
        true
    }

    /// `Some(false)` forces the operation outside any per-operation
    /// transaction even inside an atomic migration; `Some(true)` forces one.
    fn atomic(&self) -> Option<bool> {
        None
    }

    /// Fragment used when suggesting a migration name.
    fn name_fragment(&self) -> Option<String> {
        None
    }

    fn describe(&self) -> String;
}
