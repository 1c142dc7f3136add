/*!
Backend de cache injoignable, pour vérifier le mode dégradé de `CacheLayer`
*/

use async_trait::async_trait;
use chaosmonkey_kernel::cache::{CacheStats, CacheStore};
use chaosmonkey_kernel::errors::CacheError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct UnreachableStore {
    attempts: AtomicUsize,
}

impl UnreachableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nombre d'opérations tentées sur le backend
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn refuse<T>(&self) -> Result<T, CacheError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[async_trait]
impl CacheStore for UnreachableStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.refuse()
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        self.refuse()
    }

    async fn clear(&self, _pattern: &str) -> Result<usize, CacheError> {
        self.refuse()
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.refuse()
    }
}
