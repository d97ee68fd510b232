//! Gate discovery library
//!
//! Learns physical gates from location-tagged check-ins, binds each gate to
//! the attendee categories it admits, and keeps that model current with
//! explained decisions. Exposes modules for integration testing and binary
//! reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
