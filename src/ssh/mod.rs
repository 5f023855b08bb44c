//! SSH tunnel for Git-over-SSH.
//!
//! Accepts SSH connections from Git clients, authenticates them (password
//! credentials are validated like HTTP credentials; public keys follow the
//! configured acceptance policy), parses the single `exec` request, opens an
//! outbound session to the origin SSH endpoint as the canonical git user and
//! splices the two pack streams together. The proxy is content-agnostic for
//! the bytes in between.

pub mod server;
pub mod session;
pub mod upstream;

pub use server::start_ssh_server;
