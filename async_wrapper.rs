// Async wrapper for the NdStore hierarchical array store
// Provides non-blocking operations using tokio::task::spawn_blocking

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tokio::task;

pub mod errors {
    include!("errors.rs");
}

// Include the sync implementation with module isolation
mod sync_store {
    include!("ndstore.rs");
}

pub use errors::{IoContext, NdStoreError, Result};
pub use sync_store::{
    ArrayValue, Cell, DataBuf, DataPredicate, DatasetInfo, Dtype, FileLock, LockGuard, NdStore,
    Path, PathPredicate, RecordSet, SetMode, Value,
};

/// Owned predicate forms usable across `spawn_blocking` boundaries.
pub type BoxedPathPredicate = Box<dyn Fn(&Path) -> bool + Send + Sync>;
pub type BoxedDataPredicate = Box<dyn Fn(&str, &Path) -> bool + Send + Sync>;

fn join_error(e: task::JoinError) -> NdStoreError {
    NdStoreError::Io {
        context: "joining blocking store task".to_string(),
        source: io::Error::new(io::ErrorKind::Other, e),
    }
}

/// Async wrapper around the synchronous NdStore.
/// Every call runs its critical section on the blocking thread pool, so
/// lock polling never stalls the async runtime.
pub struct AsyncNdStore {
    inner: Arc<NdStore>,
}

impl AsyncNdStore {
    /// Bind a store to the given backing path
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = task::spawn_blocking(move || NdStore::open(&path))
            .await
            .map_err(join_error)??;

        Ok(AsyncNdStore {
            inner: Arc::new(store),
        })
    }

    /// Write named values under a path asynchronously
    pub async fn set(
        &self,
        data: BTreeMap<String, Value>,
        path: Path,
        mode: SetMode,
    ) -> Result<()> {
        let store = self.inner.clone();

        task::spawn_blocking(move || store.set(data, &path, mode))
            .await
            .map_err(join_error)?
    }

    /// Query the store into a record set asynchronously
    pub async fn get(
        &self,
        path_pred: Option<BoxedPathPredicate>,
        data_pred: Option<BoxedDataPredicate>,
        want_all: bool,
        squeeze: bool,
    ) -> Result<RecordSet> {
        let store = self.inner.clone();

        task::spawn_blocking(move || {
            store.get(
                path_pred.as_deref().map(|p| p as &PathPredicate<'_>),
                data_pred.as_deref().map(|p| p as &DataPredicate<'_>),
                want_all,
                squeeze,
            )
        })
        .await
        .map_err(join_error)?
    }

    /// Keep only the matching leaves asynchronously
    pub async fn filter(
        &self,
        path_pred: Option<BoxedPathPredicate>,
        data_pred: Option<BoxedDataPredicate>,
    ) -> Result<()> {
        let store = self.inner.clone();

        task::spawn_blocking(move || {
            store.filter(
                path_pred.as_deref().map(|p| p as &PathPredicate<'_>),
                data_pred.as_deref().map(|p| p as &DataPredicate<'_>),
            )
        })
        .await
        .map_err(join_error)?
    }

    /// Render the matching part of the store asynchronously
    pub async fn show(
        &self,
        path_pred: Option<BoxedPathPredicate>,
        data_pred: Option<BoxedDataPredicate>,
    ) -> Result<String> {
        let store = self.inner.clone();

        task::spawn_blocking(move || {
            store.show(
                path_pred.as_deref().map(|p| p as &PathPredicate<'_>),
                data_pred.as_deref().map(|p| p as &DataPredicate<'_>),
            )
        })
        .await
        .map_err(join_error)?
    }

    /// Sorted distinct path keys asynchronously
    pub async fn index_keys(&self) -> Result<Vec<String>> {
        let store = self.inner.clone();

        task::spawn_blocking(move || store.index_keys())
            .await
            .map_err(join_error)?
    }

    /// Sorted distinct values for one path key asynchronously
    pub async fn index_values(&self, key: &str) -> Result<Vec<String>> {
        let store = self.inner.clone();
        let key = key.to_string();

        task::spawn_blocking(move || store.index_values(&key))
            .await
            .map_err(join_error)?
    }

    /// Sorted distinct dataset names asynchronously
    pub async fn col_keys(&self) -> Result<Vec<String>> {
        let store = self.inner.clone();

        task::spawn_blocking(move || store.col_keys())
            .await
            .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_async_set_and_get() {
        let dir = tempdir().unwrap();
        let store = AsyncNdStore::open(dir.path().join("store.json"))
            .await
            .unwrap();

        let path = Path::from_pairs([("i1", "3")]).unwrap();
        store
            .set(
                record(&[("col1", Value::Int(1)), ("col2", Value::Int(2))]),
                path,
                SetMode::Overwrite,
            )
            .await
            .unwrap();

        let pred: BoxedDataPredicate = Box::new(|name, _| name == "col1");
        let set = store.get(None, Some(pred), true, true).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.path_value(0, "i1"), Some("3"));
        assert_eq!(set.data_value(0, "col1"), Some(&Cell::Value(Value::Int(1))));
        assert_eq!(set.data_value(0, "col2"), None);
    }

    #[tokio::test]
    async fn test_async_concurrent_appends() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            AsyncNdStore::open(dir.path().join("store.json"))
                .await
                .unwrap(),
        );

        let mut handles = vec![];
        for task_id in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for step in 0..5 {
                    let path =
                        Path::from_pairs([("task", task_id.to_string())]).unwrap();
                    store
                        .set(
                            record(&[("loss", Value::Float(step as f64))]),
                            path,
                            SetMode::Append,
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every task appended 5 scalars into its own growable dataset.
        let set = store.get(None, None, true, false).await.unwrap();
        assert_eq!(set.len(), 8);
        for row in 0..8 {
            match set.data_value(row, "loss") {
                Some(Cell::Value(Value::Array(a))) => assert_eq!(a.shape(), [5]),
                other => panic!("unexpected cell {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_async_show_and_introspection() {
        let dir = tempdir().unwrap();
        let store = AsyncNdStore::open(dir.path().join("store.json"))
            .await
            .unwrap();

        for value in ["1", "2"] {
            let path = Path::from_pairs([("epoch", value)]).unwrap();
            store
                .set(
                    record(&[("acc", Value::Float(0.5))]),
                    path,
                    SetMode::Overwrite,
                )
                .await
                .unwrap();
        }

        assert_eq!(store.index_keys().await.unwrap(), ["epoch"]);
        assert_eq!(store.index_values("epoch").await.unwrap(), ["1", "2"]);
        assert_eq!(store.col_keys().await.unwrap(), ["acc"]);

        let text = store.show(None, None).await.unwrap();
        assert!(text.contains("> epoch=1"));
        assert!(text.contains("- acc (shape=[], dtype=float64)"));
    }

    #[tokio::test]
    async fn test_async_filter() {
        let dir = tempdir().unwrap();
        let store = AsyncNdStore::open(dir.path().join("store.json"))
            .await
            .unwrap();

        let path = Path::from_pairs([("run", "a")]).unwrap();
        store
            .set(
                record(&[("keep", Value::Int(1)), ("drop", Value::Int(2))]),
                path,
                SetMode::Overwrite,
            )
            .await
            .unwrap();

        let keep: BoxedDataPredicate = Box::new(|name, _| name == "keep");
        store.filter(None, Some(keep)).await.unwrap();

        assert_eq!(store.col_keys().await.unwrap(), ["keep"]);
    }
}
