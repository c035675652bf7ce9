//! Integration test helpers for roundtable end-to-end scenarios.
//!
//! Everything runs in-process: a rendezvous service on a loopback port,
//! nodes with file-backed stores in temp directories, control clients over
//! real Unix sockets, and fake agent endpoints.

pub mod harness;
