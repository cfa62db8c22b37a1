//! Conflict-free core of livecode: the replicated text document and the
//! awareness store. No IO lives here; the collab crate moves the bytes.

pub mod awareness;
pub mod codec;
pub mod text;

pub use awareness::{AwarenessRecord, AwarenessStore, CursorColor, Selection};
pub use codec::CodecError;
pub use text::{
    ApplyReport, Element, ElementId, LamportClock, Op, RejectedOp, ReplicatedText, SiteId,
    TextError, Update,
};
