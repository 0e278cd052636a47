//! Service endpoint descriptors.
//!
//! An [`Endpoint`] names one addressable instance of a remote service:
//! service name, an opaque id, and an optional application-defined payload
//! that bifrost never interprets. Endpoints are immutable once built; a
//! membership source replaces them rather than mutating them.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{PoolError, Result};

/// Characters allowed in service names and endpoint ids.
///
/// Restricted to the set that can appear in a URL without escaping, so
/// services can be referred to with a URL-looking structure
/// (e.g. `prod://services/profile-v1`).
fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':')
}

fn validate(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PoolError::Configuration(format!("{field} must not be empty")));
    }
    if let Some(bad) = value.chars().find(|c| !is_valid_char(*c)) {
        return Err(PoolError::Configuration(format!(
            "{field} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// An addressable instance of a remote service.
///
/// Equality covers `(service_name, id, payload)`; hashing covers only
/// `(service_name, id)` so that an endpoint re-registered with a new
/// payload lands in the same bucket as the one it replaces. Cache keying
/// uses [`EndpointKey`], which ignores the payload entirely.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    service_name: String,
    id: String,
    payload: Option<String>,
}

impl Endpoint {
    /// Start building an endpoint.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// The name of the service this endpoint belongs to.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The opaque identifier for this endpoint.
    ///
    /// The format and any information contained within it is application
    /// specific; bifrost does not introspect into it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The optional payload provided by whoever registered the endpoint.
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// The cache-keying identity of this endpoint: `(service_name, id)`.
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            service_name: self.service_name.clone(),
            id: self.id.clone(),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name
            && self.id == other.id
            && self.payload == other.payload
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_name.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.id)
    }
}

/// Identity of an endpoint for cache-keying purposes.
///
/// Two endpoints that differ only in payload share a key: the instance
/// cache treats them as the same slot owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    service_name: String,
    id: String,
}

impl EndpointKey {
    /// The service name component of the key.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The endpoint id component of the key.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.id)
    }
}

/// Builder enforcing charset validity on service names and ids.
#[derive(Debug, Default)]
pub struct EndpointBuilder {
    service_name: Option<String>,
    id: Option<String>,
    payload: Option<String>,
}

impl EndpointBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service name. Restricted charset: `[a-zA-Z0-9._:-]`.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the endpoint id. Restricted charset: `[a-zA-Z0-9._:-]`.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the optional payload. Not validated or interpreted.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Build the endpoint, validating the service name and id.
    pub fn build(self) -> Result<Endpoint> {
        let service_name = self
            .service_name
            .ok_or_else(|| PoolError::Configuration("service name is required".into()))?;
        let id = self
            .id
            .ok_or_else(|| PoolError::Configuration("endpoint id is required".into()))?;
        validate("service name", &service_name)?;
        validate("endpoint id", &id)?;
        Ok(Endpoint {
            service_name,
            id,
            payload: self.payload,
        })
    }
}
