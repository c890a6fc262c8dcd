//! Destination-domain keys
//!
//! Every recipient address is reduced to a [`DomainKey`] before anything else
//! happens to it. Transport configuration, transport handles and per-domain
//! rate limiters are all looked up by this key, so two addresses whose domains
//! differ only in case must always produce the same key.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A normalised, lower-cased destination domain
///
/// Addresses without a usable domain map to the reserved [`DomainKey::DEFAULT`]
/// key, which is also the key used for the fallback transport configuration.
///
/// # Examples
///
/// ```
/// use herald_common::DomainKey;
///
/// let key = DomainKey::from_address("Jane <jane@Example.COM>");
/// assert_eq!(key.as_str(), "example.com");
///
/// assert!(DomainKey::from_address("   ").is_default());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct DomainKey(Arc<str>);

impl DomainKey {
    /// The reserved key for addresses with no usable domain
    pub const DEFAULT: &'static str = "default";

    /// Create a key from a bare domain, normalising it
    #[must_use]
    pub fn new(domain: &str) -> Self {
        normalise(domain).map_or_else(Self::default_key, |d| Self(Arc::from(d)))
    }

    /// The reserved `"default"` key
    #[must_use]
    pub fn default_key() -> Self {
        Self(Arc::from(Self::DEFAULT))
    }

    /// Derive the key for a recipient address
    ///
    /// Display-name forms are understood (`Name <user@host>`). If the address
    /// cannot be parsed as a mailbox the text after the last `@` is used.
    #[must_use]
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        if address.is_empty() {
            return Self::default_key();
        }

        let mailbox = mailparse::addrparse(address)
            .ok()
            .and_then(|list| {
                list.iter().find_map(|addr| match addr {
                    mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
                    mailparse::MailAddr::Group(group) => {
                        group.addrs.first().map(|info| info.addr.clone())
                    }
                })
            })
            .unwrap_or_else(|| address.to_string());

        mailbox
            .rsplit_once('@')
            .map_or_else(Self::default_key, |(_, domain)| Self::new(domain))
    }

    /// Whether this is the reserved `"default"` key
    #[must_use]
    pub fn is_default(&self) -> bool {
        &*self.0 == Self::DEFAULT
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalise(domain: &str) -> Option<String> {
    let domain = domain
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(['>', ']'])
        .trim_end_matches('.');

    if domain.is_empty() || domain.chars().any(|c| c.is_whitespace() || c == '@') {
        return None;
    }

    Some(domain.to_lowercase())
}

impl Default for DomainKey {
    fn default() -> Self {
        Self::default_key()
    }
}

impl Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DomainKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for DomainKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for DomainKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DomainKey {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_plain_address() {
        assert_eq!(DomainKey::from_address("a@x.com").as_str(), "x.com");
    }

    #[test]
    fn test_case_insensitive() {
        for address in ["user@Example.com", "USER@EXAMPLE.COM", "user@example.com"] {
            assert_eq!(DomainKey::from_address(address).as_str(), "example.com");
            assert_eq!(
                DomainKey::from_address(address),
                DomainKey::from_address(&address.to_uppercase())
            );
        }
    }

    #[test]
    fn test_display_name_form() {
        let key = DomainKey::from_address("Jane Doe <jane@Mail.Example.org>");
        assert_eq!(key.as_str(), "mail.example.org");
    }

    #[test]
    fn test_surrounding_whitespace_and_trailing_dot() {
        assert_eq!(
            DomainKey::from_address("  someone@example.net.  ").as_str(),
            "example.net"
        );
    }

    #[test]
    fn test_unusable_addresses_map_to_default() {
        for address in ["", "   ", "no-at-sign", "user@", "user@   "] {
            let key = DomainKey::from_address(address);
            assert!(key.is_default(), "{address:?} should map to default");
        }
    }

    #[test]
    fn test_new_normalises() {
        assert_eq!(DomainKey::new(" NewCo.COM ").as_str(), "newco.com");
        assert!(DomainKey::new("").is_default());
    }

    #[test]
    fn test_serde_transparent() {
        let key = DomainKey::new("serde.example.com");
        let serialized = serde_json::to_string(&key).unwrap();
        assert_eq!(serialized, "\"serde.example.com\"");

        let deserialized: DomainKey = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, key);
    }

    #[test]
    fn test_hash_lookup() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(DomainKey::from_address("a@Hash.example.com"), 42);

        assert_eq!(map.get(&DomainKey::new("hash.example.com")), Some(&42));
    }
}
