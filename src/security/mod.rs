//! Destination policy and client-input validation.
//!
//! Every upstream fetch passes through [`ssrf::validate_upstream_url`] before
//! a connection is opened, and every route parameter is checked against the
//! shape rules in [`validation`] and [`path`].

pub mod path;
pub mod ssrf;
pub mod validation;
