//! Token-based authentication for the orchestrator API.
//!
//! Two kinds of callers:
//! - the service token, shared by operators and the ML advisor, generated on
//!   first start and kept in a 0600 file
//! - per-facility tokens from configuration, held only as SHA-256 digests

use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{Error, Result};

/// Service token for privileged API access
#[derive(Debug, Clone)]
pub struct ServiceToken {
    /// Random 256-bit token
    pub token: [u8; 32],
    /// Token ID for logging
    pub token_id: uuid::Uuid,
}

impl ServiceToken {
    /// Generate a new service token
    pub fn generate() -> Self {
        Self {
            token: rand::random(),
            token_id: uuid::Uuid::new_v4(),
        }
    }

    /// Base64 form presented in the `Authorization` header
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.token)
    }

    /// Write token to file with restricted permissions (0600)
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.encoded())?;
        fs::set_permissions(path, Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Read token from file
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let encoded = fs::read_to_string(path)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Other(format!("Invalid token encoding: {}", e)))?;

        let token: [u8; 32] = decoded.try_into().map_err(|_| Error::InvalidToken)?;
        Ok(Self {
            token,
            token_id: uuid::Uuid::new_v4(),
        })
    }

    /// Read the token at `path`, generating and saving one if absent
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::read_from_file(path);
        }
        let token = Self::generate();
        token.write_to_file(path)?;
        tracing::info!(token_id = %token.token_id, path = %path.display(), "Generated service token");
        Ok(token)
    }

    /// Verify an encoded candidate.
    ///
    /// Digests are compared in constant time, so any decoded length works.
    pub fn verify(&self, candidate: &str) -> bool {
        let Ok(bytes) = STANDARD.decode(candidate.trim()) else {
            return false;
        };
        constant_time_eq(&Sha256::digest(self.token), &Sha256::digest(&bytes))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hex SHA-256 digest of a token
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

/// Authentication context extracted from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Authenticated via the service token
    Service { token_id: uuid::Uuid },
    /// Authenticated as a named facility
    Facility { name: String },
}

impl AuthContext {
    /// Name used in logs
    pub fn principal(&self) -> String {
        match self {
            AuthContext::Service { .. } => "service".to_string(),
            AuthContext::Facility { name } => format!("facility:{}", name),
        }
    }
}

/// All credentials the API accepts
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    service: ServiceToken,
    /// digest → facility name
    facilities: HashMap<String, String>,
}

impl TokenRegistry {
    pub fn new(service: ServiceToken) -> Self {
        Self {
            service,
            facilities: HashMap::new(),
        }
    }

    /// Register a facility by the plaintext token it presents
    pub fn with_facility(mut self, name: impl Into<String>, token: &str) -> Self {
        self.facilities.insert(token_digest(token), name.into());
        self
    }

    pub fn service_token(&self) -> &ServiceToken {
        &self.service
    }

    pub fn authenticate(&self, candidate: &str) -> Option<AuthContext> {
        if self.service.verify(candidate) {
            return Some(AuthContext::Service {
                token_id: self.service.token_id,
            });
        }
        self.facilities
            .get(&token_digest(candidate))
            .map(|name| AuthContext::Facility { name: name.clone() })
    }
}
