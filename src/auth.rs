//! Proxy credentials: the `user:secret` store and Basic `Proxy-Authorization` decoding.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use base64::{Engine as _, engine::general_purpose};
use log::{debug, warn};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{AuthFailure, ProxyError};

/// A user that presented valid credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
}

/// Read-only credential lookup, loaded once at startup.
#[derive(Default)]
pub struct CredentialStore {
    secrets: HashMap<String, Zeroizing<String>>,
}

impl CredentialStore {
    pub fn from_entries<I, U, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, S)>,
        U: Into<String>,
        S: Into<String>,
    {
        Self {
            secrets: entries
                .into_iter()
                .map(|(user, secret)| (user.into(), Zeroizing::new(secret.into())))
                .collect(),
        }
    }

    /// Loads a credential file with one `user:secret` pair per line.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
            ProxyError::Load {
                path: path.to_path_buf(),
                source,
            }
        })?);
        let store = Self::parse(&content);
        debug!("Loaded {} credential(s) from {}", store.len(), path.display());
        Ok(store)
    }

    /// Parses credential file content. Blank lines and `#` comments are ignored,
    /// the secret is everything after the first colon and later duplicates win.
    pub fn parse(content: &str) -> Self {
        let mut secrets = HashMap::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, secret)) if !user.is_empty() => {
                    secrets.insert(user.to_string(), Zeroizing::new(secret.to_string()));
                }
                _ => warn!("Skipping malformed credential entry on line {}", index + 1),
            }
        }
        Self { secrets }
    }

    pub fn verify(&self, user: &str, secret: &str) -> bool {
        match self.secrets.get(user) {
            Some(expected) => constant_time_eq(expected.as_bytes(), secret.as_bytes()),
            None => false,
        }
    }

    /// Checks a raw `Proxy-Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Identity, AuthFailure> {
        let (user, secret) = decode_basic(header)?;
        if self.verify(&user, &secret) {
            Ok(Identity { user })
        } else {
            Err(AuthFailure::InvalidCredentials(user))
        }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("users", &self.secrets.len())
            .finish()
    }
}

/// Decodes `Basic <base64(user:secret)>`. The scheme name is case-insensitive.
pub fn decode_basic(header: Option<&str>) -> Result<(String, Zeroizing<String>), AuthFailure> {
    let value = header.ok_or(AuthFailure::MissingHeader)?.trim();
    let (scheme, encoded) = value
        .split_once(' ')
        .ok_or(AuthFailure::Malformed("missing credentials after scheme"))?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthFailure::UnsupportedScheme(scheme.to_string()));
    }

    let decoded = Zeroizing::new(
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthFailure::Malformed("invalid base64 encoding"))?,
    );
    let credentials = std::str::from_utf8(&decoded)
        .map_err(|_| AuthFailure::Malformed("invalid UTF-8 in credentials"))?;
    let (user, secret) = credentials
        .split_once(':')
        .ok_or(AuthFailure::Malformed("expected user:secret"))?;
    Ok((user.to_string(), Zeroizing::new(secret.to_string())))
}

#[must_use]
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
