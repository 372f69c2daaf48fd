//! Resolution services: the {get, put, delete, list_versions} capability set, its
//! store-backed variant, and a composite that fans writes out to several services.

use std::sync::Arc;

use async_trait::async_trait;

use crate::descriptor::{ContentDescriptor, MetadataError};
use crate::identifier::ContentIdentifier;
use crate::outcome::Status;
use crate::store::{ContentStore, StoreError};

/// A provider of name-to-descriptor lookups and registrations.
#[async_trait]
pub trait ResolutionService: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, identifier: &ContentIdentifier)
        -> Result<ContentDescriptor, ResolutionError>;

    async fn put(&self, descriptor: &ContentDescriptor) -> Result<(), ResolutionError>;

    async fn delete(&self, identifier: &ContentIdentifier) -> Result<(), ResolutionError>;

    /// Known versions of multi-version content. May be empty.
    async fn list_versions(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<Vec<ContentIdentifier>, ResolutionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("not found: {0}")]
    NotFound(ContentIdentifier),
    #[error("{service} does not support {operation}")]
    Unsupported {
        service: &'static str,
        operation: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("protocol exchange failed: {0}")]
    Protocol(Status),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store-backed service. Synchronous underneath, never touches the network.
pub struct LocalResolutionService {
    store: Arc<ContentStore>,
}

impl LocalResolutionService {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }
}

#[async_trait]
impl ResolutionService for LocalResolutionService {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<ContentDescriptor, ResolutionError> {
        self.store
            .get(identifier)
            .ok_or_else(|| ResolutionError::NotFound(identifier.clone()))
    }

    async fn put(&self, descriptor: &ContentDescriptor) -> Result<(), ResolutionError> {
        self.store.put(descriptor.clone())?;
        Ok(())
    }

    async fn delete(&self, identifier: &ContentIdentifier) -> Result<(), ResolutionError> {
        match self.store.remove(identifier)? {
            Some(_) => Ok(()),
            None => Err(ResolutionError::NotFound(identifier.clone())),
        }
    }

    /// The store keeps one version per identifier.
    async fn list_versions(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<Vec<ContentIdentifier>, ResolutionError> {
        if self.store.contains(identifier) {
            Ok(vec![identifier.clone()])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Ordered composition of services, selected by configuration.
/// Reads stop at the first service that answers. Writes go to every service and
/// succeed if one of them accepts.
pub struct ResolutionChain {
    services: Vec<Arc<dyn ResolutionService>>,
}

impl ResolutionChain {
    pub fn new(services: Vec<Arc<dyn ResolutionService>>) -> Self {
        Self { services }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl ResolutionService for ResolutionChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn get(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<ContentDescriptor, ResolutionError> {
        let mut last = ResolutionError::NotFound(identifier.clone());
        for service in &self.services {
            match service.get(identifier).await {
                Ok(d) => return Ok(d),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Every service is attempted. Succeeds if any service accepted the descriptor;
    /// otherwise the last error is returned.
    async fn put(&self, descriptor: &ContentDescriptor) -> Result<(), ResolutionError> {
        let mut stored = false;
        let mut last = None;
        for service in &self.services {
            match service.put(descriptor).await {
                Ok(()) => stored = true,
                Err(e) => last = Some(e),
            }
        }
        if stored {
            return Ok(());
        }
        Err(last.unwrap_or_else(|| {
            ResolutionError::TransportUnavailable("no resolution services".into())
        }))
    }

    /// Succeeds if any service deleted the identifier.
    async fn delete(&self, identifier: &ContentIdentifier) -> Result<(), ResolutionError> {
        let mut deleted = false;
        for service in &self.services {
            if service.delete(identifier).await.is_ok() {
                deleted = true;
            }
        }
        if deleted {
            Ok(())
        } else {
            Err(ResolutionError::NotFound(identifier.clone()))
        }
    }

    async fn list_versions(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<Vec<ContentIdentifier>, ResolutionError> {
        for service in &self.services {
            if let Ok(versions) = service.list_versions(identifier).await {
                if !versions.is_empty() {
                    return Ok(versions);
                }
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> Arc<LocalResolutionService> {
        Arc::new(LocalResolutionService::new(Arc::new(ContentStore::in_memory())))
    }

    fn descriptor(hash: &str) -> ContentDescriptor {
        ContentDescriptor::new(ContentIdentifier::new("sha-256", hash), "text/html")
    }

    struct Unsupported;

    #[async_trait]
    impl ResolutionService for Unsupported {
        fn name(&self) -> &'static str {
            "unsupported"
        }
        async fn get(&self, _: &ContentIdentifier) -> Result<ContentDescriptor, ResolutionError> {
            Err(ResolutionError::Unsupported {
                service: "unsupported",
                operation: "get",
            })
        }
        async fn put(&self, _: &ContentDescriptor) -> Result<(), ResolutionError> {
            Err(ResolutionError::Protocol(Status::Failed))
        }
        async fn delete(&self, _: &ContentIdentifier) -> Result<(), ResolutionError> {
            Err(ResolutionError::Unsupported {
                service: "unsupported",
                operation: "delete",
            })
        }
        async fn list_versions(
            &self,
            _: &ContentIdentifier,
        ) -> Result<Vec<ContentIdentifier>, ResolutionError> {
            Err(ResolutionError::Unsupported {
                service: "unsupported",
                operation: "list_versions",
            })
        }
    }

    #[tokio::test]
    async fn local_get_put_delete() {
        let svc = local();
        let d = descriptor("aa");
        assert!(matches!(
            svc.get(d.identifier()).await,
            Err(ResolutionError::NotFound(_))
        ));
        svc.put(&d).await.unwrap();
        assert_eq!(svc.get(d.identifier()).await.unwrap(), d);
        assert_eq!(
            svc.list_versions(d.identifier()).await.unwrap(),
            vec![d.identifier().clone()]
        );
        svc.delete(d.identifier()).await.unwrap();
        assert!(matches!(
            svc.delete(d.identifier()).await,
            Err(ResolutionError::NotFound(_))
        ));
        assert!(svc.list_versions(d.identifier()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chain_reads_fall_through_and_writes_fan_out() {
        let a = local();
        let b = local();
        let chain = ResolutionChain::new(vec![
            Arc::new(Unsupported) as Arc<dyn ResolutionService>,
            a.clone(),
            b.clone(),
        ]);
        let d = descriptor("bb");

        chain.put(&d).await.unwrap();
        assert!(a.store().contains(d.identifier()));
        assert!(b.store().contains(d.identifier()));

        assert_eq!(chain.get(d.identifier()).await.unwrap(), d);
        chain.delete(d.identifier()).await.unwrap();
        assert!(a.store().is_empty());
        assert!(b.store().is_empty());
    }

    #[tokio::test]
    async fn chain_put_with_local_only_succeeds() {
        let a = local();
        let unreachable = Arc::new(Unsupported) as Arc<dyn ResolutionService>;
        let chain = ResolutionChain::new(vec![a.clone(), unreachable.clone()]);
        let d = descriptor("cc");
        chain.put(&d).await.unwrap();
        assert!(a.store().contains(d.identifier()));

        let nothing_accepts = ResolutionChain::new(vec![unreachable]);
        assert!(matches!(
            nothing_accepts.put(&d).await,
            Err(ResolutionError::Protocol(Status::Failed))
        ));
        assert!(matches!(
            ResolutionChain::new(vec![]).put(&d).await,
            Err(ResolutionError::TransportUnavailable(_))
        ));
    }
}
