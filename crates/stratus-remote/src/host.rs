//! Hosts and the credentials used to reach them.

use std::fmt;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::{RemoteError, RemoteResult};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// How to authenticate against a host.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Private key file.
    KeyFile(PathBuf),
    /// Password; kept out of logs and process arguments.
    Password(SecretString),
}

impl Credential {
    /// Password credential from a plain string.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(SecretString::from(password.into()))
    }
}

/// A host to run operations on.
#[derive(Debug, Clone)]
pub struct Host {
    /// Network address (name or IP).
    pub address: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Authentication.
    pub credential: Credential,
}

impl Host {
    /// Create a host on the default port.
    #[must_use]
    pub fn new(address: impl Into<String>, user: impl Into<String>, credential: Credential) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            credential,
        }
    }

    /// Use a non-default port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `user@address` as used by ssh and scp.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

/// Ordered list of hosts a dispatch runs against.
///
/// Output and results of a dispatch follow this order.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    hosts: Vec<Host>,
}

impl HostSet {
    /// Wrap an ordered host list.
    #[must_use]
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }

    /// Number of hosts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Host at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Host> {
        self.hosts.get(index)
    }

    /// Iterate hosts in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Host> {
        self.hosts.iter()
    }

    /// Subset of hosts, in the order the indices are given.
    ///
    /// # Errors
    ///
    /// [`RemoteError::HostIndexOutOfRange`] for an index past the end.
    pub fn select(&self, indices: &[usize]) -> RemoteResult<Self> {
        indices
            .iter()
            .map(|&index| {
                self.hosts
                    .get(index)
                    .cloned()
                    .ok_or(RemoteError::HostIndexOutOfRange {
                        index,
                        len: self.hosts.len(),
                    })
            })
            .collect()
    }
}

impl FromIterator<Host> for HostSet {
    fn from_iter<I: IntoIterator<Item = Host>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a HostSet {
    type Item = &'a Host;
    type IntoIter = std::slice::Iter<'a, Host>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.iter()
    }
}
