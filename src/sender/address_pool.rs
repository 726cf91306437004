//! Ordered set of server addresses with redirect support.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    address: String,
    /// Non-zero for a redirect entry.
    revision: u64,
}

/// Server addresses in the order they are tried.
///
/// The first entry is the current address. A failure rotates it to the
/// back. A server may redirect the agent; the redirect target becomes the
/// current address until a newer redirect replaces it or a failure rotates
/// past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    entries: Vec<Entry>,
}

impl AddressPool {
    /// Create a pool from configured addresses, kept in order.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: addresses
                .into_iter()
                .map(|address| Entry {
                    address: address.into(),
                    revision: 0,
                })
                .collect(),
        }
    }

    /// Address to use for the next attempt.
    pub fn current(&self) -> Option<&str> {
        self.entries.first().map(|e| e.address.as_str())
    }

    /// Rotate the current address to the back.
    pub fn next(&mut self) {
        if !self.entries.is_empty() {
            self.entries.rotate_left(1);
        }
    }

    /// Rotate away from the current address if it is a redirect.
    pub fn reset(&mut self) {
        if self.entries.first().is_some_and(|e| e.revision != 0) {
            self.next();
        }
    }

    /// Make `address` the current address.
    ///
    /// A redirect older than the one already held is refused; if that stale
    /// redirect is the current address it is rotated away. Returns whether
    /// the redirect was applied.
    pub fn add_redirect(&mut self, address: impl Into<String>, revision: u64) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.revision != 0) {
            if revision < self.entries[pos].revision {
                if pos == 0 {
                    self.next();
                }
                return false;
            }
            self.entries.remove(pos);
        }

        self.entries.insert(
            0,
            Entry {
                address: address.into(),
                revision,
            },
        );
        true
    }

    /// Number of addresses, including a redirect.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool holds no address.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addresses: Vec<&str> = self.entries.iter().map(|e| e.address.as_str()).collect();
        write!(f, "{}", addresses.join(","))
    }
}
