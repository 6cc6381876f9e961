//! The savestate field-emission contract (spec.md §6, §9).
//!
//! Every stateful device in this core implements [`io::state::IoSnapshot`] by
//! emitting or restoring a flat sequence of `(object, field, bytes)` triples.
//! This crate only fixes that contract and a couple of shared constants; the
//! actual encoding (compression, file format) lives in `aero-snapshot` and is
//! explicitly out of scope for this one (spec.md §1 Non-goals: "Savestate
//! serialization is described as an interface contract, not a format").

pub mod io;
