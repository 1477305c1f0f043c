//! Password verification with a per-user credential cache.
//!
//! User records carry a bcrypt hash, which is deliberately slow to check.
//! After the first successful bcrypt verification the cache keeps a random
//! salt and `SHA-256(salt || password)` for that user, so later checks cost
//! one SHA-256.  An entry is only trusted while the user's stored bcrypt hash
//! is the one it was derived from; the store also drops entries whenever a
//! command changes the user.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::MetaError;
use crate::metadata::data::UserInfo;

const SALT_BYTES: usize = 32;

/// Smallest cost bcrypt accepts; only useful for tests.
pub const MIN_BCRYPT_COST: u32 = 4;

#[derive(Debug, Clone)]
struct AuthUser {
    salt: Vec<u8>,
    hash: Vec<u8>,
    /// The bcrypt hash this entry was verified against.
    bhash: String,
}

/// Username → salted hash cache.
#[derive(Debug, Default)]
pub struct AuthCache {
    users: Mutex<HashMap<String, AuthUser>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `password` against `user`, consulting the cache first.
    pub fn verify(&self, user: &UserInfo, password: &str) -> Result<(), MetaError> {
        let cached = {
            let users = self.users.lock().expect("mutex poisoned");
            users.get(&user.name).cloned()
        };

        if let Some(au) = cached {
            if au.bhash == user.hash {
                let hash = salted_hash(&au.salt, password);
                return if bool::from(hash.as_slice().ct_eq(au.hash.as_slice())) {
                    Ok(())
                } else {
                    Err(MetaError::AuthenticationFailed)
                };
            }
        }

        match bcrypt::verify(password, &user.hash) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(MetaError::AuthenticationFailed),
        }

        let salt: [u8; SALT_BYTES] = rand::random();
        let entry = AuthUser {
            hash: salted_hash(&salt, password),
            salt: salt.to_vec(),
            bhash: user.hash.clone(),
        };
        self.users
            .lock()
            .expect("mutex poisoned")
            .insert(user.name.clone(), entry);
        Ok(())
    }

    pub fn invalidate(&self, username: &str) {
        self.users.lock().expect("mutex poisoned").remove(username);
    }

    pub fn clear(&self) {
        self.users.lock().expect("mutex poisoned").clear();
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users
            .lock()
            .expect("mutex poisoned")
            .contains_key(username)
    }
}

/// Produce the bcrypt hash stored in a user record.
pub fn hash_password(password: &str, cost: u32) -> Result<String, MetaError> {
    bcrypt::hash(password, cost).map_err(|e| MetaError::Internal(anyhow::anyhow!(e)))
}

fn salted_hash(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn user(name: &str, password: &str) -> UserInfo {
        UserInfo {
            name: name.to_string(),
            hash: hash_password(password, MIN_BCRYPT_COST).unwrap(),
            admin: false,
            privileges: BTreeMap::new(),
        }
    }

    #[test]
    fn test_verify_populates_cache() {
        let cache = AuthCache::new();
        let u = user("susy", "pass");
        assert!(!cache.contains("susy"));

        cache.verify(&u, "pass").unwrap();
        assert!(cache.contains("susy"));
        cache.verify(&u, "pass").unwrap();
    }

    #[test]
    fn test_wrong_password_fails_with_and_without_cache() {
        let cache = AuthCache::new();
        let u = user("susy", "pass");
        assert!(matches!(
            cache.verify(&u, "nope"),
            Err(MetaError::AuthenticationFailed)
        ));
        assert!(!cache.contains("susy"));

        cache.verify(&u, "pass").unwrap();
        assert!(matches!(
            cache.verify(&u, "nope"),
            Err(MetaError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_changed_hash_bypasses_stale_entry() {
        let cache = AuthCache::new();
        let old = user("susy", "old");
        cache.verify(&old, "old").unwrap();

        let new = user("susy", "new");
        assert!(matches!(
            cache.verify(&new, "old"),
            Err(MetaError::AuthenticationFailed)
        ));
        cache.verify(&new, "new").unwrap();
    }

    #[test]
    fn test_invalidate() {
        let cache = AuthCache::new();
        cache.verify(&user("susy", "pass"), "pass").unwrap();
        cache.invalidate("susy");
        assert!(!cache.contains("susy"));
    }
}
