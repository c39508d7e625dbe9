//! Boundary to the external credential system. The core only consumes the
//! resulting identity; token minting and password hashing live elsewhere.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: String,
}

impl Identity {
    pub fn guest(connection_id: &str) -> Self {
        Self {
            username: format!("guest-{}", &connection_id[..connection_id.len().min(8)]),
            role: "guest".to_string(),
        }
    }
}

pub trait Authenticator: Send + Sync {
    /// Returns the authenticated identity, or `None` to refuse the connection.
    fn authenticate(&self, connection_id: &str, token: Option<&str>) -> Option<Identity>;
}

/// Default policy: every connection is admitted as a guest. Deployments with
/// a credential service plug their own implementation in here.
pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn authenticate(&self, connection_id: &str, _token: Option<&str>) -> Option<Identity> {
        Some(Identity::guest(connection_id))
    }
}
