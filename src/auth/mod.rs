//! Client authorization.
//!
//! Credentials presented by git clients are checked against upstream before
//! anything is served from a mirror, with a short-lived in-process cache of
//! positive answers.

pub mod cache;
pub mod http_validator;

pub use http_validator::{AuthError, UpstreamAuthorizer};
