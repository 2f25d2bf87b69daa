//! Authentication and destination checks applied before any upstream connect.
//!
//! # Check Order
//!
//! 1. Credentials, when a credential store is configured.
//! 2. Allow list: a match permits the target outright.
//! 3. Private, loopback and link-local literal targets (`PrivateNetworkTarget`),
//!    unless private targets are globally permitted.
//! 4. Block list.
//!
//! Hostnames are never resolved here. Only IP literals and `localhost` names
//! are treated as private. IPv4 literals in the shorthand forms the system
//! resolver also accepts (`127.1`, `2130706433`, `0x7f.0.0.1`) count as literals.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use log::debug;

use crate::auth::{CredentialStore, Identity};
use crate::context::DenyReason;
use crate::error::{AuthFailure, ProxyError};
use crate::parser::parse_ipv4_loose;

/// Result of a destination check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeguardVerdict {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
}

impl SafeguardVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Allow and block pattern sets. A pattern matches the host itself and every
/// subdomain of it: `example.com` covers `www.example.com` but not `notexample.com`.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    allow: HashSet<String>,
    block: HashSet<String>,
}

impl DomainPolicy {
    pub fn new<A, B, S>(allow: A, block: B) -> Self
    where
        A: IntoIterator<Item = S>,
        B: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allow: allow.into_iter().filter_map(|p| normalize_pattern(p.as_ref())).collect(),
            block: block.into_iter().filter_map(|p| normalize_pattern(p.as_ref())).collect(),
        }
    }

    /// Loads optional allow and block list files.
    pub fn from_files(allow: Option<&Path>, block: Option<&Path>) -> Result<Self, ProxyError> {
        let allow = allow.map(load_patterns).transpose()?.unwrap_or_default();
        let block = block.map(load_patterns).transpose()?.unwrap_or_default();
        Ok(Self { allow, block })
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        matches_any(&self.allow, host)
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        matches_any(&self.block, host)
    }

    pub fn allow_count(&self) -> usize {
        self.allow.len()
    }

    pub fn block_count(&self) -> usize {
        self.block.len()
    }
}

/// Reads a domain list file: one pattern per line, `#` comments and blank lines ignored.
pub fn load_patterns(path: &Path) -> Result<HashSet<String>, ProxyError> {
    let content = std::fs::read_to_string(path).map_err(|source| ProxyError::Load {
        path: path.to_path_buf(),
        source,
    })?;
    let patterns = parse_patterns(&content);
    debug!("Loaded {} domain pattern(s) from {}", patterns.len(), path.display());
    Ok(patterns)
}

pub fn parse_patterns(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(normalize_pattern)
        .collect()
}

/// Lowercases and strips `*.`/`.` prefixes and a trailing dot.
fn normalize_pattern(raw: &str) -> Option<String> {
    let pattern = raw.trim().to_ascii_lowercase();
    let pattern = pattern
        .strip_prefix("*.")
        .or_else(|| pattern.strip_prefix('.'))
        .unwrap_or(pattern.as_str());
    let pattern = pattern.trim_end_matches('.');
    let pattern = pattern
        .strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .unwrap_or(pattern);
    (!pattern.is_empty()).then(|| pattern.to_string())
}

/// Lowercased host without brackets or a trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn matches_any(patterns: &HashSet<String>, host: &str) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let host = normalize_host(host);
    if patterns.contains(&host) {
        return true;
    }
    // IP literals only match exactly.
    if host.parse::<IpAddr>().is_ok() {
        return false;
    }
    let mut rest = host.as_str();
    while let Some((_, parent)) = rest.split_once('.') {
        if patterns.contains(parent) {
            return true;
        }
        rest = parent;
    }
    false
}

fn private_ranges() -> Vec<IpNet> {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "::/128",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .filter_map(|s| s.parse::<IpNet>().ok())
    .collect()
}

pub struct SafeguardChecker {
    credentials: Option<Arc<CredentialStore>>,
    policy: Arc<DomainPolicy>,
    allow_private: bool,
    private_ranges: Vec<IpNet>,
}

impl SafeguardChecker {
    pub fn new(credentials: Option<Arc<CredentialStore>>, policy: Arc<DomainPolicy>) -> Self {
        Self {
            credentials,
            policy,
            allow_private: false,
            private_ranges: private_ranges(),
        }
    }

    /// Lets private and loopback literal targets through without allow-list entries.
    pub fn with_allow_private(mut self, allow_private: bool) -> Self {
        self.allow_private = allow_private;
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    /// Returns `Ok(None)` when authentication is disabled.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Option<Identity>, AuthFailure> {
        match &self.credentials {
            Some(store) => store.authenticate(header).map(Some),
            None => Ok(None),
        }
    }

    pub fn check_destination(&self, host: &str) -> SafeguardVerdict {
        let host = normalize_host(host);
        let host = match parse_ipv4_loose(&host) {
            Some(v4) if host.parse::<IpAddr>().is_err() => v4.to_string(),
            _ => host,
        };

        if self.policy.is_allowed(&host) {
            return SafeguardVerdict::allow();
        }
        if !self.allow_private && self.is_private_target(&host) {
            return SafeguardVerdict::deny(DenyReason::PrivateNetworkTarget);
        }
        if self.policy.is_blocked(&host) {
            return SafeguardVerdict::deny(DenyReason::BlockedDomain);
        }
        SafeguardVerdict::allow()
    }

    /// Literal private addresses and `localhost` names. No DNS lookups.
    pub fn is_private_target(&self, host: &str) -> bool {
        let ip = host
            .parse::<IpAddr>()
            .ok()
            .or_else(|| parse_ipv4_loose(host).map(IpAddr::V4));
        match ip {
            Some(ip) => self.is_private_ip(ip),
            None => host == "localhost" || host.ends_with(".localhost"),
        }
    }

    fn is_private_ip(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        ip.is_loopback()
            || ip.is_unspecified()
            || ip.is_multicast()
            || matches!(ip, IpAddr::V4(v4) if v4.is_broadcast())
            || self.private_ranges.iter().any(|net| net.contains(&ip))
    }
}

impl fmt::Debug for SafeguardChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeguardChecker")
            .field("auth", &self.requires_auth())
            .field("allow_patterns", &self.policy.allow_count())
            .field("block_patterns", &self.policy.block_count())
            .field("allow_private", &self.allow_private)
            .finish()
    }
}
