//! Unit tests for the session core
//!
//! Covers the event bus, the monitor state machine and the observers
//! against an in-memory store and a manual clock.

pub mod support;
