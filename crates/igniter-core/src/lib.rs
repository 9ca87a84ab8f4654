//! Igniter Core - shared error taxonomy and schema seam.
//!
//! Every crate in the workspace reports errors through [`IgniterError`],
//! which carries the stable error codes, HTTP status hints, and structured
//! diagnostics shared by the store and the job queue. Payload validation
//! flows through the [`schema::PayloadSchema`] trait.

pub mod error;
pub mod schema;

pub use error::{IgniterError, IgniterResult};
pub use schema::{PayloadSchema, SchemaIssue, SchemaRef};
