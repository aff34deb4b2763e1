//! Hostbridge Connectors
//!
//! Host-side collaborators the script bridge talks to. The bridge only ever
//! sees these through the traits in this crate, so tests can substitute mocks.
//!
//! - [`NetworkClient`] performs HTTP requests on behalf of scripts
//! - [`NlpEngine`] scores and tags text for the NLP helpers
//!
//! [`HttpClient`] is the reqwest-backed network client used by default.

mod error;
mod http;
mod traits;

pub use error::*;
pub use http::*;
pub use traits::*;
