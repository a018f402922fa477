//! Client identity and server trust
//!
//! The driver asks a [`CredentialProvider`] for the application instance
//! certificate before every connect, and hands it the server's certificate
//! chain once the session is up. A rejected chain fails the attempt with a
//! connection error; the reconnect monitor decides whether to try again.

use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{SecurityPolicy, UaDriverOptions};

/// DER-encoded application instance certificate and private key
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Security policy {0:?} requires a client certificate")]
    MissingIdentity(SecurityPolicy),

    /// `fingerprint` is the hex SHA-256 of the DER leaf certificate
    #[error("Server certificate {fingerprint} is not trusted")]
    UntrustedServer { fingerprint: String },

    #[error("Server presented no certificate")]
    EmptyChain,

    #[error("Failed to load credential material: {0}")]
    Io(String),
}

/// Supplies client certificates and validates server chains
pub trait CredentialProvider: Send + Sync {
    /// Identity to present for the given options, if any
    fn client_identity(
        &self,
        options: &UaDriverOptions,
    ) -> Result<Option<ClientIdentity>, CredentialError>;

    /// Accept or reject the chain presented by the server (leaf first)
    fn validate_server_chain(&self, chain: &[Vec<u8>]) -> Result<(), CredentialError>;
}

/// No client certificate; every server is trusted
///
/// Only usable with [`SecurityPolicy::None`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredentials;

impl CredentialProvider for AnonymousCredentials {
    fn client_identity(
        &self,
        options: &UaDriverOptions,
    ) -> Result<Option<ClientIdentity>, CredentialError> {
        match options.security_policy {
            SecurityPolicy::None => Ok(None),
            policy => Err(CredentialError::MissingIdentity(policy)),
        }
    }

    fn validate_server_chain(&self, _chain: &[Vec<u8>]) -> Result<(), CredentialError> {
        Ok(())
    }
}

/// Fixed identity and an explicit list of trusted server certificates
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    identity: ClientIdentity,
    trusted: Vec<Vec<u8>>,
}

impl StaticCredentials {
    pub fn new(identity: ClientIdentity, trusted: Vec<Vec<u8>>) -> Self {
        Self { identity, trusted }
    }

    /// Load DER files from disk
    pub fn from_files(
        certificate: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
        trusted: &[impl AsRef<Path>],
    ) -> Result<Self, CredentialError> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| CredentialError::Io(format!("{}: {}", path.display(), e)))
        };
        let identity = ClientIdentity {
            certificate: read(certificate.as_ref())?,
            private_key: read(private_key.as_ref())?,
        };
        let trusted = trusted
            .iter()
            .map(|p| read(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(identity, trusted))
    }
}

impl CredentialProvider for StaticCredentials {
    fn client_identity(
        &self,
        _options: &UaDriverOptions,
    ) -> Result<Option<ClientIdentity>, CredentialError> {
        Ok(Some(self.identity.clone()))
    }

    fn validate_server_chain(&self, chain: &[Vec<u8>]) -> Result<(), CredentialError> {
        let leaf = chain.first().ok_or(CredentialError::EmptyChain)?;
        if self.trusted.iter().any(|t| t == leaf) {
            return Ok(());
        }
        Err(CredentialError::UntrustedServer {
            fingerprint: fingerprint(leaf),
        })
    }
}

/// Hex SHA-256 of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
