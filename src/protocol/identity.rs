//! Session identities.
//!
//! Every physical connection carries an identity string:
//!
//! ```text
//! [role]:[vhost]:[secret]:[uuid]
//! ```
//!
//! The server uses it to tie a TCP session to a logical requester or
//! worker, so a new one is generated for every connection, including each
//! worker reconnect.

use std::fmt;

use uuid::Uuid;

use crate::endpoint::Endpoint;

/// Which side of the protocol a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Request/response client (`req`).
    Requester,
    /// Long-lived event worker (`dlr`).
    Dealer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Requester => "req",
            Role::Dealer => "dlr",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh identity for `role` talking to `endpoint`.
pub fn generate(role: Role, endpoint: &Endpoint) -> String {
    format!(
        "{}:{}:{}:{}",
        role.as_str(),
        endpoint.vhost(),
        endpoint.credential(),
        Uuid::new_v4()
    )
}
