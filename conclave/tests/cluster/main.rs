//! Multi-node cluster tests.
//!
//! These tests drive several engines against each other through an
//! in-memory wire: every engine's task graph runs for real on one
//! `LocalSet`, and the harness routes queued peer messages between the
//! engines instead of sockets. That keeps the full protocol — proposers,
//! acceptors, executor, sweeper, recovery — under test with none of the
//! socket nondeterminism.

mod harness;
mod invariants;
mod scenarios;
