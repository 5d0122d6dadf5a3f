use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::models::IPContext;
use crate::storage::{KvStore, StoreResult};

/// Read side of the IPv4 context cache.
#[derive(Clone)]
pub struct ContextCache {
    store: Arc<dyn KvStore>,
}

impl ContextCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Look up the context stored for `ip`.
    ///
    /// `Ok(None)` means no record exists; an `Err` is a backend or decoding
    /// failure and must not be reported to callers as "not found".
    pub async fn lookup_by_ip(&self, ip: Ipv4Addr) -> StoreResult<Option<IPContext>> {
        let Some(raw) = self.store.get(&ip.to_string()).await? else {
            return Ok(None);
        };

        let context: IPContext = serde_json::from_str(&raw)?;
        if context.ip.is_empty() {
            return Ok(None);
        }

        Ok(Some(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_lookup_by_ip() {
        let memory = Arc::new(MemoryStore::new());
        memory
            .set("1.2.3.4", r#"{"ip":"1.2.3.4","risks":["TUNNEL"]}"#, None)
            .await
            .unwrap();
        let cache = ContextCache::new(memory);

        let found = cache
            .lookup_by_ip("1.2.3.4".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.risks, vec!["TUNNEL".to_string()]);

        let missing = cache.lookup_by_ip("5.6.7.8".parse().unwrap()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_record_without_ip_is_not_found() {
        let memory = Arc::new(MemoryStore::new());
        memory.set("1.2.3.4", "{}", None).await.unwrap();
        let cache = ContextCache::new(memory);

        assert!(cache
            .lookup_by_ip("1.2.3.4".parse().unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_undecodable_record_is_an_error() {
        let memory = Arc::new(MemoryStore::new());
        memory.set("1.2.3.4", "not json", None).await.unwrap();
        let cache = ContextCache::new(memory);

        assert!(cache.lookup_by_ip("1.2.3.4".parse().unwrap()).await.is_err());
    }
}
