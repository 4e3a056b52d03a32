//! Federated addresses (`[local@]domain[/resource]`)
//!
//! A [`Jid`] is the key every other component uses to talk about an account.
//! It is immutable once parsed; equality and hashing are structural over all
//! three parts, so `alice@example.com` and `alice@example.com/phone` are
//! different keys. Use [`Jid::bare`] to drop the resource.
//!
//! ```rust
//! use viska_xmpp_core::Jid;
//!
//! let jid: Jid = "alice@example.com/phone".parse().unwrap();
//! assert_eq!(jid.local_part(), Some("alice"));
//! assert_eq!(jid.domain_part(), "example.com");
//! assert_eq!(jid.resource_part(), Some("phone"));
//! assert_eq!(jid.bare().to_string(), "alice@example.com");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{XmppError, XmppResult};

/// Longest allowed part, in bytes
const MAX_PART_LEN: usize = 1023;

/// Characters a local part may not contain
const FORBIDDEN_LOCAL: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

/// An XMPP address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse an address, failing with `MalformedIdentity` on bad syntax
    pub fn parse(input: &str) -> XmppResult<Self> {
        let (bare, resource) = match input.find('/') {
            Some(idx) => (&input[..idx], Some(&input[idx + 1..])),
            None => (input, None),
        };
        let (local, domain) = match bare.rfind('@') {
            Some(idx) => (Some(&bare[..idx]), &bare[idx + 1..]),
            None => (None, bare),
        };

        if let Some(local) = local {
            if local.is_empty() {
                return Err(XmppError::malformed_identity(input, "empty local part"));
            }
            if local.len() > MAX_PART_LEN {
                return Err(XmppError::malformed_identity(input, "local part too long"));
            }
            if local
                .chars()
                .any(|c| FORBIDDEN_LOCAL.contains(&c) || c.is_whitespace() || c.is_control())
            {
                return Err(XmppError::malformed_identity(
                    input,
                    "local part contains a forbidden character",
                ));
            }
        }

        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return Err(XmppError::malformed_identity(input, "empty domain part"));
        }
        if domain.len() > MAX_PART_LEN {
            return Err(XmppError::malformed_identity(input, "domain part too long"));
        }
        if domain
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '@')
        {
            return Err(XmppError::malformed_identity(
                input,
                "domain part contains a forbidden character",
            ));
        }

        if let Some(resource) = resource {
            if resource.is_empty() {
                return Err(XmppError::malformed_identity(input, "empty resource part"));
            }
            if resource.len() > MAX_PART_LEN {
                return Err(XmppError::malformed_identity(input, "resource part too long"));
            }
        }

        Ok(Self {
            local: local.map(str::to_string),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(str::to_string),
        })
    }

    /// Build an address from already validated parts
    pub fn from_parts(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> XmppResult<Self> {
        let mut text = String::new();
        if let Some(local) = local {
            text.push_str(local);
            text.push('@');
        }
        text.push_str(domain);
        if let Some(resource) = resource {
            text.push('/');
            text.push_str(resource);
        }
        Self::parse(&text)
    }

    pub fn local_part(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    pub fn resource_part(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The same address without its resource part
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The same address bound to `resource`
    pub fn with_resource(&self, resource: &str) -> XmppResult<Jid> {
        Jid::from_parts(self.local.as_deref(), &self.domain, Some(resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Jid::parse(&text).map_err(serde::de::Error::custom)
    }
}
