//! HTTP layer of the git caching proxy.
//!
//! Serves git smart-HTTP requests (`info/refs`, `git-upload-pack`) out of
//! local mirrors, passes pushes through to upstream, and streams every
//! response through a bounded relay.

pub mod handler;
pub mod pktline;
pub mod relay;
pub mod session;
