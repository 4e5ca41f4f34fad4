//! Client credentials forwarded to upstream.
//!
//! Git clients authenticate against the proxy with an HTTP `Authorization`
//! header.  The same credentials are embedded into upstream URLs for clone and
//! fetch, and scrubbed from anything that ends up in a log line.

pub mod upstream;

pub use upstream::{redact_text, redact_url, Credentials};
