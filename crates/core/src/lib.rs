//! spirereg core types: SPIFFE IDs, selector sets and registration entries.
//!
//! Everything in here is pure. The registry client and reconciler build on
//! these types; nothing in this crate performs I/O.

#![forbid(unsafe_code)]

pub mod entry;
pub mod error;
pub mod selector;
pub mod spiffe_id;
pub mod wire;

pub use entry::{EntrySpec, Field, RegistrationEntry};
pub use error::{IdError, SelectorError, ValidationError, ValidationErrorKind};
pub use selector::{Selector, SelectorSet};
pub use spiffe_id::{IdInput, SpiffeId};
pub use wire::{WireEntry, WireSelector};

pub mod prelude {
    pub use super::{
        EntrySpec, Field, IdError, IdInput, RegistrationEntry, Selector, SelectorError, SelectorSet, SpiffeId,
        ValidationError, ValidationErrorKind, WireEntry, WireSelector,
    };
}
