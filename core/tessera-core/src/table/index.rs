//! Secondary index call contract used by the merge engine.

use crate::error::TesseraResult;
use crate::pack::Pack;

/// Receives row-level changes while the merge engine rewrites packs.
///
/// Positions refer to the pack passed in and are only valid during the call.
pub trait IndexHook: Send + Sync {
    /// Index name, used to disconnect.
    fn name(&self) -> &str;

    /// Row `pos` of `pack` was added.
    fn on_insert(&self, pack: &Pack, pos: usize) -> TesseraResult<()>;

    /// Row `prev_pos` of `prev` is about to be replaced by row `next_pos` of
    /// `next`.
    fn on_update(&self, prev: &Pack, prev_pos: usize, next: &Pack, next_pos: usize)
    -> TesseraResult<()>;

    /// Rows `pos..pos + n` of `pack` are about to be removed.
    fn on_delete(&self, pack: &Pack, pos: usize, n: usize) -> TesseraResult<()>;

    /// The merge finished; persist buffered index state.
    fn sync(&self) -> TesseraResult<()>;
}
