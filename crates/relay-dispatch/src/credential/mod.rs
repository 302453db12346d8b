//! The credential record and its per-model health state.
//!
//! Storage and cooldown scheduling live one level up in
//! [`crate::conductor`] and [`crate::cooldown_queue`]; this module only
//! defines the value types and the availability decision from the data
//! model's "Credential Record & Transient State" component.

mod record;

pub use record::{
    Availability, CredentialRecord, LastError, ModelState, Quota, Status, TransientState,
    UnavailableReason, cooldown_for_status,
};
