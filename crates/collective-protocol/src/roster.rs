//! Server identities and rosters.

use collective_crypto::PublicKey;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An addressable node: where to reach it and the key it signs with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub address: String,
    pub public_key: PublicKey,
}

impl ServerIdentity {
    pub fn new(address: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            address: address.into(),
            public_key,
        }
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Ordered set of servers a client may contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub list: Vec<ServerIdentity>,
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        Self { list }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Pick a contact node uniformly at random.
    pub fn random(&self) -> Option<&ServerIdentity> {
        self.list.choose(&mut rand::thread_rng())
    }

    pub fn get(&self, index: usize) -> Option<&ServerIdentity> {
        self.list.get(index)
    }

    pub fn position(&self, address: &str) -> Option<usize> {
        self.list.iter().position(|s| s.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerIdentity> {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Roster {
        Roster::new(
            (0..n)
                .map(|i| {
                    ServerIdentity::new(format!("10.0.0.{i}:7770"), PublicKey(vec![i as u8; 32]))
                })
                .collect(),
        )
    }

    #[test]
    fn test_random_empty() {
        assert!(Roster::default().random().is_none());
    }

    #[test]
    fn test_random_picks_member() {
        let r = roster(5);
        for _ in 0..20 {
            let picked = r.random().unwrap();
            assert!(r.position(&picked.address).is_some());
        }
    }

    #[test]
    fn test_position() {
        let r = roster(3);
        assert_eq!(r.position("10.0.0.2:7770"), Some(2));
        assert_eq!(r.position("10.0.0.9:7770"), None);
    }
}
