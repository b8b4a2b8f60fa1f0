//! Threadline: threaded direct messaging with revision history.
//!
//! Messages between identities form reply trees. Edits keep a snapshot of the
//! content they replace, every new message produces exactly one notification
//! for its receiver, and removing an identity removes everything it owns.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod messaging;
