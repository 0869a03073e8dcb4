//! Domain entities for devlink.
//!
//! This module contains pure business types with no infrastructure
//! dependencies: the identity of a device endpoint, and the stages an install
//! passes through together with the compensating action each stage requires
//! when it fails.
//!
//! Code in outer layers (session, transport, CLI) depends on the domain, but
//! the domain never depends on them.

/// Device identity and endpoint descriptor.
pub mod device;

/// Install stage machine and per-stage compensation.
pub mod install;
