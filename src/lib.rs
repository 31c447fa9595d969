//! Core library for the rig_services application.
//!
//! This library drives the external recording and stimulus devices of an
//! experiment rig through a uniform lifecycle:
//! `initialize → test → start → verify → stop → finalize → validate`.
//! Device integrations declare what they support through capability traits;
//! the lifecycle engine owns the generic policy around them.

pub mod config;
pub mod coordinator;
pub mod device;
pub mod devices;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metadata;
