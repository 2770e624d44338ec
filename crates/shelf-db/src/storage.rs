//! Store contracts shared by the bare stores and their caching wrappers

use crate::blob::BlobReader;
use crate::error::Result;
use crate::namespace::{self, SimpleDocument};
use crate::types::{
    BlobEntryMeta, DocumentEntry, DocumentEntryMeta, LikeExpr, ListFilter, NamespaceFilter,
};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Namespaced, versioned JSON document storage.
///
/// Dropping a returned future cancels the operation; a write that already
/// reached the engine stays committed.
pub trait DocumentStorage: Send + Sync {
    /// Insert or overwrite `(namespace, key)` and return the stored entry
    fn write(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
    ) -> impl Future<Output = Result<DocumentEntry>> + Send;

    fn read(
        &self,
        namespace: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<DocumentEntry>>> + Send;

    /// Delete one key, or the whole namespace when `key` is `None`, limited to
    /// entries whose `last_modified` falls in the inclusive range. Returns the
    /// number of rows removed.
    fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn list(&self, namespace: &str, filter: ListFilter) -> BoxStream<'static, Result<DocumentEntry>>;

    fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<DocumentEntryMeta>>;

    fn count(
        &self,
        namespace: Option<&str>,
        key_pattern: Option<&LikeExpr>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Checkpoint the write-ahead log; `force` also truncates it
    fn flush(&self, force: bool) -> impl Future<Output = Result<()>> + Send;

    /// Best-effort file rewrite; failures are logged, never returned
    fn compact(&self) -> impl Future<Output = ()> + Send;
}

/// Namespaced, versioned binary storage with streamed payloads
pub trait BlobStorage: Send + Sync {
    /// Store exactly `declared_len` bytes from `source` under `(namespace, key)`.
    ///
    /// Extra source bytes are left unread. A source that ends early fails
    /// with `StreamLengthMismatch` and leaves the row partially written, as
    /// does cancelling through `cancel`.
    fn write<R>(
        &self,
        namespace: &str,
        key: &str,
        source: R,
        declared_len: u64,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<BlobEntryMeta>> + Send
    where
        R: AsyncRead + Unpin + Send + 'static;

    fn write_bytes(
        &self,
        namespace: &str,
        key: &str,
        data: &[u8],
    ) -> impl Future<Output = Result<BlobEntryMeta>> + Send;

    /// Open the payload for reading. The reader holds its own snapshot and
    /// never blocks writers.
    fn read(
        &self,
        namespace: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<(BlobEntryMeta, BlobReader)>>> + Send;

    fn read_bytes(
        &self,
        namespace: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<(BlobEntryMeta, Vec<u8>)>>> + Send;

    fn delete(
        &self,
        namespace: &str,
        key: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Entries of `namespace` together with a reader for each payload
    fn list(
        &self,
        namespace: &str,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<(BlobEntryMeta, BlobReader)>>;

    fn list_meta(
        &self,
        namespace: NamespaceFilter,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<BlobEntryMeta>>;

    fn count(
        &self,
        namespace: Option<&str>,
        key_pattern: Option<&LikeExpr>,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn flush(&self, force: bool) -> impl Future<Output = Result<()>> + Send;

    fn compact(&self) -> impl Future<Output = ()> + Send;
}

/// Typed helpers over any [`DocumentStorage`]
pub trait DocumentStorageExt: DocumentStorage {
    fn write_typed<T>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> impl Future<Output = Result<DocumentEntry<T>>> + Send
    where
        T: Serialize + DeserializeOwned + Sync,
    {
        async move {
            let value = serde_json::to_value(value)?;
            self.write(namespace, key, &value).await?.decode()
        }
    }

    fn read_typed<T>(
        &self,
        namespace: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<DocumentEntry<T>>>> + Send
    where
        T: DeserializeOwned + Send,
    {
        async move {
            match self.read(namespace, key).await? {
                Some(entry) => entry.decode().map(Some),
                None => Ok(None),
            }
        }
    }

    fn list_typed<T>(
        &self,
        namespace: &str,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<DocumentEntry<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.list(namespace, filter)
            .map(|item| item.and_then(|entry| entry.decode()))
            .boxed()
    }

    fn write_simple<T: SimpleDocument>(
        &self,
        key: &str,
        value: &T,
    ) -> impl Future<Output = Result<DocumentEntry<T>>> + Send {
        async move {
            let ns = namespace::resolve::<T>();
            self.write_typed(&ns, key, value).await
        }
    }

    fn read_simple<T: SimpleDocument>(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<DocumentEntry<T>>>> + Send {
        async move {
            let ns = namespace::resolve::<T>();
            self.read_typed(&ns, key).await
        }
    }

    fn list_simple<T: SimpleDocument>(
        &self,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<DocumentEntry<T>>> {
        self.list_typed(&namespace::resolve::<T>(), filter)
    }

    fn delete_simple<T: SimpleDocument>(&self, key: &str) -> impl Future<Output = Result<u64>> + Send {
        async move {
            let ns = namespace::resolve::<T>();
            self.delete(&ns, Some(key), None, None).await
        }
    }

    fn count_simple<T: SimpleDocument>(&self) -> impl Future<Output = Result<u64>> + Send {
        async move {
            let ns = namespace::resolve::<T>();
            self.count(Some(&ns), None).await
        }
    }
}

impl<S: DocumentStorage> DocumentStorageExt for S {}
