use std::{collections::HashMap, sync::Arc};

use sha2::{Digest, Sha256};
use shared::domain::{Identity, PubKey};

const ADJECTIVES: [&str; 16] = [
    "amber", "brisk", "calm", "dusky", "eager", "frosty", "gentle", "hidden", "ivory", "jolly",
    "keen", "lucid", "mellow", "nimble", "quiet", "rusty",
];

const NOUNS: [&str; 16] = [
    "Badger", "Comet", "Dingo", "Egret", "Falcon", "Gecko", "Heron", "Ibis", "Jackal", "Koala",
    "Lynx", "Marten", "Newt", "Otter", "Puffin", "Quail",
];

/// Derives a display identity from a public key and codeset version.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, pubkey: &PubKey, codeset: u8) -> Identity;
}

pub struct CodenameResolver;

impl IdentityResolver for CodenameResolver {
    fn resolve(&self, pubkey: &PubKey, codeset: u8) -> Identity {
        let mut hasher = Sha256::new();
        hasher.update([codeset]);
        hasher.update(pubkey.as_str().as_bytes());
        let digest = hasher.finalize();

        let adjective = ADJECTIVES[usize::from(digest[0]) % ADJECTIVES.len()];
        let noun = NOUNS[usize::from(digest[1]) % NOUNS.len()];
        let number = u16::from_be_bytes([digest[2], digest[3]]) % 1000;

        Identity {
            pubkey: pubkey.clone(),
            codeset,
            codename: format!("{adjective}{noun}{number:03}"),
            color: format!("#{:02x}{:02x}{:02x}", digest[4], digest[5], digest[6]),
        }
    }
}

/// Per-session memo of resolved identities.
pub struct IdentityCache {
    resolver: Arc<dyn IdentityResolver>,
    entries: HashMap<(PubKey, u8), Identity>,
}

impl IdentityCache {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            resolver,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, pubkey: &PubKey, codeset: u8) -> Identity {
        self.entries
            .entry((pubkey.clone(), codeset))
            .or_insert_with(|| self.resolver.resolve(pubkey, codeset))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
