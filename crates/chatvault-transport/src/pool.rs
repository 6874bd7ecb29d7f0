use std::sync::atomic::{AtomicUsize, Ordering};

use chatvault_types::VaultError;
use sha2::{Digest, Sha256};
use tracing::info;

/// One account usable against the messaging service. The secret token never
/// leaves this struct; everything persisted or shared uses the derived `id`.
#[derive(Debug, Clone)]
pub struct Credential {
    id: String,
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let id = hex::encode(&hasher.finalize()[..6]);
        Self { id, token }
    }

    /// Stable opaque identifier, safe to record in the catalog and in share
    /// descriptors.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Round-robin pool of credentials. Selection order is strict: the shared
/// cursor advances atomically once per acquisition, so over K picks each of
/// N credentials is chosen either floor(K/N) or ceil(K/N) times.
pub struct CredentialPool {
    credentials: Vec<Credential>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self, VaultError> {
        if credentials.is_empty() {
            return Err(VaultError::Internal(
                "credential pool needs at least one credential".into(),
            ));
        }
        info!("Credential pool initialized with {} entries", credentials.len());
        Ok(Self {
            credentials,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, VaultError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(tokens.into_iter().map(Credential::new).collect())
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Next credential in strict round-robin order.
    pub fn acquire(&self) -> &Credential {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.credentials[n % self.credentials.len()]
    }

    /// Look up a credential by its recorded id. Absent when the credential
    /// has been removed from configuration since the chunk was stored.
    pub fn by_id(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id() == id)
    }

    /// Route a fetch for a chunk stored by `id`: the recorded credential if
    /// it is still configured, otherwise the first available one.
    pub fn by_id_or_first(&self, id: &str) -> &Credential {
        self.by_id(id).unwrap_or(&self.credentials[0])
    }

    /// The credential used for catalog-level attribution of direct sends.
    pub fn primary(&self) -> &Credential {
        &self.credentials[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn ids_are_stable_and_token_free() {
        let a = Credential::new("123456:secret-token");
        let b = Credential::new("123456:secret-token");
        assert_eq!(a.id(), b.id());
        assert!(!a.id().contains("secret"));
        assert_eq!(a.id().len(), 12);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(CredentialPool::new(vec![]).is_err());
    }

    #[test]
    fn round_robin_is_fair() {
        let pool = CredentialPool::from_tokens(["a", "b", "c"]).unwrap();
        let k = 1000;
        let mut picks: HashMap<String, usize> = HashMap::new();
        for _ in 0..k {
            *picks.entry(pool.acquire().id().to_string()).or_default() += 1;
        }
        assert_eq!(picks.len(), 3);
        for count in picks.values() {
            // floor(1000/3) = 333, ceil = 334
            assert!((333..=334).contains(count), "unfair pick count {count}");
        }
    }

    #[test]
    fn fairness_under_contention() {
        let pool = std::sync::Arc::new(CredentialPool::from_tokens(["a", "b"]).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let mut counts = HashMap::new();
                for _ in 0..500 {
                    *counts.entry(pool.acquire().id().to_string()).or_insert(0usize) += 1;
                }
                counts
            }));
        }
        let mut totals: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for (id, n) in h.join().unwrap() {
                *totals.entry(id).or_default() += n;
            }
        }
        // 2000 picks over 2 credentials: exactly 1000 each
        assert_eq!(totals.values().copied().collect::<Vec<_>>(), vec![1000, 1000]);
    }

    #[test]
    fn fallback_routing_for_removed_credentials() {
        let pool = CredentialPool::from_tokens(["a", "b"]).unwrap();
        let known = Credential::new("b");
        assert_eq!(pool.by_id_or_first(known.id()).id(), known.id());
        assert_eq!(pool.by_id_or_first("gone").id(), pool.primary().id());
        assert!(pool.by_id("gone").is_none());
    }
}
