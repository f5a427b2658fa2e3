//! Request and response schemas crossing the broker.
//!
//! Every type here is plain JSON over the wire, field names exactly as the
//! gateway and the user service produce them.

pub mod auth;
pub mod user;
