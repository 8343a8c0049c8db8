//! Backend resolution by location scheme.

use std::sync::Arc;

use stevedore_io::{
    fs::FsStorage,
    s3::{S3Auth, S3Settings},
    Location, StorageBackend,
};
use tokio::sync::OnceCell;

/// Resolves each location to its storage backend: `s3://` locations share
/// one lazily-built S3 client, everything else goes to the filesystem
/// backend. Handlers ask per job; cloning is cheap.
#[derive(Debug, Clone)]
pub struct StorageResolver {
    inner: Arc<Inner>,
}

#[derive(Debug)]
enum Inner {
    Scheme {
        settings: S3Settings,
        auth: Option<S3Auth>,
        s3: OnceCell<StorageBackend>,
        fs: FsStorage,
    },
    /// Every remote location resolves to this backend. Used by tests to
    /// substitute the in-memory storage.
    Fixed {
        remote: StorageBackend,
        fs: FsStorage,
    },
}

impl StorageResolver {
    #[must_use]
    pub fn new(settings: S3Settings, auth: Option<S3Auth>) -> Self {
        Self {
            inner: Arc::new(Inner::Scheme {
                settings,
                auth,
                s3: OnceCell::new(),
                fs: FsStorage::new(),
            }),
        }
    }

    /// Route all remote locations to one fixed backend; local locations
    /// still resolve to the real filesystem.
    #[must_use]
    pub fn fixed(remote: StorageBackend) -> Self {
        Self {
            inner: Arc::new(Inner::Fixed {
                remote,
                fs: FsStorage::new(),
            }),
        }
    }

    /// The backend for remote locations, without a location at hand. Used
    /// by bucket-level operations (`ls` with no source).
    pub async fn resolve_remote(&self) -> StorageBackend {
        match &*self.inner {
            Inner::Fixed { remote, .. } => remote.clone(),
            Inner::Scheme { settings, auth, s3, .. } => s3
                .get_or_init(|| async {
                    StorageBackend::from(settings.get_storage_client(auth.as_ref()).await)
                })
                .await
                .clone(),
        }
    }

    pub async fn resolve(&self, location: &Location) -> StorageBackend {
        match (&*self.inner, location) {
            (Inner::Scheme { fs, .. } | Inner::Fixed { fs, .. }, Location::Local(_)) => {
                StorageBackend::from(fs.clone())
            }
            (Inner::Fixed { remote, .. }, Location::S3(_)) => remote.clone(),
            (Inner::Scheme { settings, auth, s3, .. }, Location::S3(_)) => s3
                .get_or_init(|| async {
                    StorageBackend::from(settings.get_storage_client(auth.as_ref()).await)
                })
                .await
                .clone(),
        }
    }
}
