//! Core infrastructure for the redgate coordination substrate.
//!
//! This crate provides the pieces every other redgate crate builds on:
//! - Tenant identity and validation
//! - The logical Redis key schema
//! - Event system for observability

pub mod events;
pub mod keys;
pub mod tenant;

pub use events::{EventListener, EventListeners, FnListener, SubstrateEvent};
pub use keys::KeyError;
pub use tenant::{InvalidTenant, TenantId};
