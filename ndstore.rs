// Hierarchical array store addressed by key=value paths.
// Single-file sync core with:
// - cross-process mutual exclusion via hard-link lock files
// - a JSON container holding the whole group tree
// - recursive query engine merging subtrees into an aligned record set
// - filter-to-keep deletion with empty-group pruning
// - indented tree rendering with run-length path grouping

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path as StdPath, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::{IoContext, NdStoreError, Result};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

// ==================== VALUE MODEL ====================

/// Element type of a stored dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Int64,
    Float64,
    Str,
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Int64 => write!(f, "int64"),
            Dtype::Float64 => write!(f, "float64"),
            Dtype::Str => write!(f, "str"),
        }
    }
}

/// Flat row-major element buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataBuf {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
}

impl DataBuf {
    pub fn len(&self) -> usize {
        match self {
            DataBuf::Int(v) => v.len(),
            DataBuf::Float(v) => v.len(),
            DataBuf::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            DataBuf::Int(_) => Dtype::Int64,
            DataBuf::Float(_) => Dtype::Float64,
            DataBuf::Str(_) => Dtype::Str,
        }
    }

    fn concat(&mut self, other: DataBuf) -> Result<()> {
        match (self, other) {
            (DataBuf::Int(a), DataBuf::Int(b)) => a.extend(b),
            (DataBuf::Float(a), DataBuf::Float(b)) => a.extend(b),
            (DataBuf::Str(a), DataBuf::Str(b)) => a.extend(b),
            (a, b) => {
                return Err(NdStoreError::validation(format!(
                    "cannot combine {} data with existing {} data",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }
}

/// A shaped array value: shape plus flat row-major data.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    shape: Vec<usize>,
    data: DataBuf,
}

impl ArrayValue {
    /// Fails when the shape's element count does not match the buffer length.
    pub fn new(shape: Vec<usize>, data: DataBuf) -> Result<ArrayValue> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(NdStoreError::validation(format!(
                "array data length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(ArrayValue { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &DataBuf {
        &self.data
    }

    fn first_scalar(&self) -> Value {
        match &self.data {
            DataBuf::Int(v) if !v.is_empty() => Value::Int(v[0]),
            DataBuf::Float(v) if !v.is_empty() => Value::Float(v[0]),
            DataBuf::Str(v) if !v.is_empty() => Value::Str(v[0].clone()),
            _ => Value::Array(self.clone()),
        }
    }
}

/// A value writable under a dataset name: a scalar or a shaped array.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Array(ArrayValue),
}

impl Value {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Array(a) => a.shape.clone(),
            _ => Vec::new(),
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Value::Int(_) => Dtype::Int64,
            Value::Float(_) => Dtype::Float64,
            Value::Str(_) => Dtype::Str,
            Value::Array(a) => a.data.dtype(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    fn into_parts(self) -> (Vec<usize>, DataBuf) {
        match self {
            Value::Int(v) => (Vec::new(), DataBuf::Int(vec![v])),
            Value::Float(v) => (Vec::new(), DataBuf::Float(vec![v])),
            Value::Str(v) => (Vec::new(), DataBuf::Str(vec![v])),
            Value::Array(a) => (a.shape, a.data),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Value {
        let shape = vec![v.len()];
        Value::Array(ArrayValue { shape, data: DataBuf::Int(v) })
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Value {
        let shape = vec![v.len()];
        Value::Array(ArrayValue { shape, data: DataBuf::Float(v) })
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Value {
        let shape = vec![v.len()];
        Value::Array(ArrayValue { shape, data: DataBuf::Str(v) })
    }
}

/// Shape and element type of a stored dataset, without its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

// ==================== PATH CODEC ====================

/// Ordered-by-key mapping from dimension name to dimension value.
///
/// Encodes to a location string of sorted `key=value` segments joined by
/// `/`; the empty path encodes to the empty string (root). Keys must not
/// contain `=`, `/` or `,`; values must not contain `=` or `/`. Dashes in
/// keys normalize to underscores so keys stay usable as identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    keys: BTreeMap<String, String>,
}

impl Path {
    pub fn new() -> Path {
        Path::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Path>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut path = Path::new();
        for (key, value) in pairs {
            path.insert(key, value)?;
        }
        Ok(path)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into().replace('-', "_");
        let value = value.into();
        if key.is_empty() {
            return Err(NdStoreError::validation("path key must not be empty"));
        }
        for forbidden in ['=', '/', ','] {
            if key.contains(forbidden) {
                return Err(NdStoreError::validation(format!(
                    "path key '{}' contains forbidden character '{}'",
                    key, forbidden
                )));
            }
        }
        for forbidden in ['=', '/'] {
            if value.contains(forbidden) {
                return Err(NdStoreError::validation(format!(
                    "path value '{}' contains forbidden character '{}'",
                    value, forbidden
                )));
            }
        }
        self.keys.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Canonical location string: sorted `key=value` segments joined by `/`.
    pub fn location(&self) -> String {
        let segments: Vec<String> = self
            .keys
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        segments.join("/")
    }

    /// Decodes a location string. Empty segments are skipped, so leading
    /// and trailing slashes denote the root.
    pub fn parse(location: &str) -> Result<Path> {
        let mut path = Path::new();
        for segment in location.split('/').filter(|s| !s.is_empty()) {
            let (key, value) = split_segment(segment)?;
            if path.get(&key).is_some() {
                return Err(NdStoreError::validation(format!(
                    "duplicate key '{}' in location '{}'",
                    key, location
                )));
            }
            path.insert(key, value)?;
        }
        Ok(path)
    }
}

fn split_segment(segment: &str) -> Result<(String, String)> {
    match segment.split_once('=') {
        Some((key, value)) if !value.contains('=') => {
            Ok((key.replace('-', "_"), value.to_string()))
        }
        Some(_) => Err(NdStoreError::validation(format!(
            "segment '{}' contains more than one '='",
            segment
        ))),
        None => Err(NdStoreError::validation(format!(
            "segment '{}' is not of the form key=value",
            segment
        ))),
    }
}

// ==================== MUTUAL-EXCLUSION LOCK ====================

/// Cross-process lock over one backing path, built only on filesystem
/// atomicity: a hard link to the sentinel at `<path>.lock` is the lock.
/// Hard-link creation is atomic and fails with "already exists" exactly
/// when another holder is active.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Acquisition token; releases the lock on drop.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // A missing lock file means already released; swallow it.
        let _ = fs::remove_file(&self.lock_path);
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> FileLock {
        let path = path.into();
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        FileLock {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    fn ensure_sentinel(&self) -> Result<()> {
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err::<(), io::Error>(e)
                .io_context(format!("creating sentinel file {}", self.path.display())),
        }
    }

    /// Blocks until the lock is held, polling every 100 ms. No fairness
    /// between waiters.
    pub fn acquire(&self) -> Result<LockGuard> {
        self.acquire_within(None)
    }

    fn acquire_within(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        self.ensure_sentinel()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match fs::hard_link(&self.path, &self.lock_path) {
                Ok(()) => {
                    return Ok(LockGuard {
                        lock_path: self.lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                        if Instant::now() >= deadline {
                            return Err(NdStoreError::Timeout {
                                operation: "lock acquisition".to_string(),
                                duration_ms: timeout.as_millis() as u64,
                            });
                        }
                    }
                    log::trace!("lock {} is busy, retrying", self.lock_path.display());
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                // The current holder may be renaming a fresh container over
                // the sentinel; the name flickers on some filesystems.
                // Recreate the sentinel and retry instead of failing.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::trace!(
                        "sentinel {} vanished during link, recreating",
                        self.path.display()
                    );
                    self.ensure_sentinel()?;
                }
                Err(e) => {
                    return Err::<LockGuard, io::Error>(e)
                        .io_context(format!("linking lock file {}", self.lock_path.display()))
                }
            }
        }
    }

    /// Runs `op` as a critical section. The lock is released on every exit
    /// path; an error from `op` propagates after release.
    pub fn run_exclusive<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        op()
    }

    /// Bounded-wait variant; fails with a timeout error instead of blocking
    /// forever. Contention below the deadline is still absorbed silently.
    pub fn run_exclusive_timeout<T>(
        &self,
        timeout: Duration,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _guard = self.acquire_within(Some(timeout))?;
        op()
    }
}

// ==================== STORAGE BACKEND ====================

/// A stored leaf: shape, growable flag, flat data. Growable datasets were
/// created in append mode; only their axis 0 may change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dataset {
    shape: Vec<usize>,
    growable: bool,
    data: DataBuf,
}

impl Dataset {
    fn from_value(value: Value, growable: bool) -> Dataset {
        let (mut shape, data) = value.into_parts();
        // Scalars grow along a synthetic first axis.
        if growable && shape.is_empty() {
            shape = vec![1];
        }
        Dataset { shape, growable, data }
    }

    fn extend(&mut self, name: &str, value: Value) -> Result<()> {
        if !self.growable {
            return Err(NdStoreError::validation(format!(
                "dataset '{}' was not created in append mode and cannot grow",
                name
            )));
        }
        let (mut shape, data) = value.into_parts();
        if shape.is_empty() {
            shape = vec![1];
        }
        if data.dtype() != self.data.dtype() {
            return Err(NdStoreError::validation(format!(
                "dataset '{}' holds {} data, cannot append {}",
                name,
                self.data.dtype(),
                data.dtype()
            )));
        }
        if shape.len() != self.shape.len() || shape.get(1..) != self.shape.get(1..) {
            return Err(NdStoreError::ShapeMismatch {
                name: name.to_string(),
                expected: self.shape.clone(),
                found: shape,
            });
        }
        let grown = shape[0];
        self.data.concat(data)?;
        self.shape[0] += grown;
        Ok(())
    }

    fn to_value(&self) -> Value {
        if self.shape.is_empty() {
            match &self.data {
                DataBuf::Int(v) if v.len() == 1 => return Value::Int(v[0]),
                DataBuf::Float(v) if v.len() == 1 => return Value::Float(v[0]),
                DataBuf::Str(v) if v.len() == 1 => return Value::Str(v[0].clone()),
                _ => {}
            }
        }
        Value::Array(ArrayValue {
            shape: self.shape.clone(),
            data: self.data.clone(),
        })
    }

    fn info(&self) -> DatasetInfo {
        DatasetInfo {
            shape: self.shape.clone(),
            dtype: self.data.dtype(),
        }
    }
}

/// One level of the hierarchy: leaf datasets plus child groups keyed by
/// their `key=value` segment. BTreeMap order gives the stable
/// path-key-sorted traversal order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GroupNode {
    #[serde(default)]
    datasets: BTreeMap<String, Dataset>,
    #[serde(default)]
    children: BTreeMap<String, GroupNode>,
}

impl GroupNode {
    fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.children.is_empty()
    }
}

/// Backing container: the whole group tree serialized as one JSON document
/// at `<path>`. Opened and saved inside a critical section only.
#[derive(Debug)]
struct Container {
    path: PathBuf,
    root: GroupNode,
}

impl Container {
    fn open(path: &StdPath) -> Result<Container> {
        let root = match fs::read(path) {
            // The lock sentinel may have created an empty file already.
            Ok(bytes) if bytes.is_empty() => GroupNode::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| NdStoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => GroupNode::default(),
            Err(e) => {
                return Err::<Container, io::Error>(e)
                    .io_context(format!("reading container {}", path.display()))
            }
        };
        Ok(Container {
            path: path.to_path_buf(),
            root,
        })
    }

    /// Writes to a temporary file, then renames over the container. The
    /// lock name carries exclusion, not the inode, so replacing the file
    /// under the held lock is safe.
    fn save(&self) -> Result<()> {
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let bytes = serde_json::to_vec(&self.root).map_err(|e| NdStoreError::Io {
            context: "serializing container".to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        fs::write(&tmp, &bytes).io_context(format!("writing {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            // Don't leave the orphaned tmp behind for the next save to trip on.
            let _ = fs::remove_file(&tmp);
            return Err::<(), io::Error>(e)
                .io_context(format!("replacing container {}", self.path.display()));
        }
        log::debug!("saved container {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }

    fn group_at(&self, location: &str) -> Option<&GroupNode> {
        let mut node = &self.root;
        for segment in location.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    fn group_at_mut(&mut self, location: &str) -> Option<&mut GroupNode> {
        let mut node = &mut self.root;
        for segment in location.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    fn group_at_mut_or_create(&mut self, location: &str) -> &mut GroupNode {
        let mut node = &mut self.root;
        for segment in location.split('/').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node
    }

    /// Accepts exactly what the container can persist; never coerces.
    /// Non-finite floats are rejected up front: the JSON document has no
    /// representation for them, so letting one through would poison the
    /// container for every later open.
    fn ensure_compatible(value: &Value) -> Result<()> {
        match value {
            Value::Float(v) if !v.is_finite() => Err(NdStoreError::validation(format!(
                "float value {} is not finite and cannot be persisted",
                v
            ))),
            Value::Array(a) => {
                let expected: usize = a.shape.iter().product();
                if expected != a.data.len() {
                    return Err(NdStoreError::validation(format!(
                        "array data length {} does not match shape {:?}",
                        a.data.len(),
                        a.shape
                    )));
                }
                if let DataBuf::Float(data) = &a.data {
                    if let Some(bad) = data.iter().find(|v| !v.is_finite()) {
                        return Err(NdStoreError::validation(format!(
                            "float value {} is not finite and cannot be persisted",
                            bad
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn create(&mut self, location: &str, name: &str, value: Value, growable: bool) -> Result<()> {
        let group = self.group_at_mut_or_create(location);
        if group.datasets.contains_key(name) {
            return Err(NdStoreError::validation(format!(
                "dataset '{}' already exists at '{}'",
                name, location
            )));
        }
        group
            .datasets
            .insert(name.to_string(), Dataset::from_value(value, growable));
        Ok(())
    }

    fn extend(&mut self, location: &str, name: &str, value: Value) -> Result<()> {
        match self.group_at_mut(location).and_then(|g| g.datasets.get_mut(name)) {
            Some(dataset) => dataset.extend(name, value),
            None => Err(NdStoreError::validation(format!(
                "dataset '{}' does not exist at '{}'",
                name, location
            ))),
        }
    }

    fn replace(&mut self, location: &str, name: &str, value: Value) -> Result<()> {
        let group = self.group_at_mut_or_create(location);
        group
            .datasets
            .insert(name.to_string(), Dataset::from_value(value, false));
        Ok(())
    }

    fn delete(&mut self, location: &str, name: &str) -> Result<()> {
        match self.group_at_mut(location).and_then(|g| g.datasets.remove(name)) {
            Some(_) => Ok(()),
            None => Err(NdStoreError::validation(format!(
                "dataset '{}' does not exist at '{}'",
                name, location
            ))),
        }
    }

    /// No group with zero datasets and zero children survives a mutation.
    fn prune_empty(&mut self) {
        fn prune(node: &mut GroupNode) {
            node.children.retain(|_, child| {
                prune(child);
                !child.is_empty()
            });
        }
        prune(&mut self.root);
    }
}

// ==================== RECORD SET ====================

/// One cell of a record set: a full value, or (shape, dtype) when the
/// traversal runs in info-only mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Value(Value),
    Info(DatasetInfo),
}

#[derive(Debug, Clone)]
struct RecordRow {
    path: Vec<Option<String>>,
    data: Vec<Option<Cell>>,
}

/// Aligned tabular query result: path-key columns plus one column per
/// distinct dataset name seen anywhere in the traversed subtree. Cells
/// absent for a row are `None`, the explicit null marker.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    path_columns: Vec<String>,
    data_columns: Vec<String>,
    rows: Vec<RecordRow>,
}

impl RecordSet {
    fn single(path: &Path, leaves: Vec<(String, Cell)>) -> RecordSet {
        let path_columns: Vec<String> = path.iter().map(|(k, _)| k.to_string()).collect();
        let path_cells: Vec<Option<String>> =
            path.iter().map(|(_, v)| Some(v.to_string())).collect();
        let mut data_columns = Vec::with_capacity(leaves.len());
        let mut data_cells = Vec::with_capacity(leaves.len());
        for (name, cell) in leaves {
            data_columns.push(name);
            data_cells.push(Some(cell));
        }
        RecordSet {
            path_columns,
            data_columns,
            rows: vec![RecordRow {
                path: path_cells,
                data: data_cells,
            }],
        }
    }

    pub fn path_columns(&self) -> &[String] {
        &self.path_columns
    }

    pub fn data_columns(&self) -> &[String] {
        &self.data_columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn path_value(&self, row: usize, key: &str) -> Option<&str> {
        let col = self.path_columns.iter().position(|c| c == key)?;
        self.rows.get(row)?.path.get(col)?.as_deref()
    }

    pub fn data_value(&self, row: usize, name: &str) -> Option<&Cell> {
        let col = self.data_columns.iter().position(|c| c == name)?;
        self.rows.get(row)?.data.get(col)?.as_ref()
    }

    /// Outer-join merge: union the columns, pad the missing side with
    /// nulls, keep existing rows first and append the child's rows.
    fn merge(&mut self, child: RecordSet) {
        for column in &child.path_columns {
            if !self.path_columns.contains(column) {
                self.path_columns.push(column.clone());
            }
        }
        for column in &child.data_columns {
            if !self.data_columns.contains(column) {
                self.data_columns.push(column.clone());
            }
        }
        for row in &mut self.rows {
            row.path.resize(self.path_columns.len(), None);
            row.data.resize(self.data_columns.len(), None);
        }
        for row in child.rows {
            let mut path = vec![None; self.path_columns.len()];
            for (i, cell) in row.path.into_iter().enumerate() {
                if let Some(idx) = self
                    .path_columns
                    .iter()
                    .position(|c| *c == child.path_columns[i])
                {
                    path[idx] = cell;
                }
            }
            let mut data = vec![None; self.data_columns.len()];
            for (i, cell) in row.data.into_iter().enumerate() {
                if let Some(idx) = self
                    .data_columns
                    .iter()
                    .position(|c| *c == child.data_columns[i])
                {
                    data[idx] = cell;
                }
            }
            self.rows.push(RecordRow { path, data });
        }
    }

    /// Collapses every single-element array cell into its scalar. Nulls
    /// stay null.
    pub fn squeeze(&mut self) {
        for row in &mut self.rows {
            for cell in &mut row.data {
                if let Some(Cell::Value(Value::Array(a))) = cell {
                    if a.data.len() == 1 {
                        *cell = Some(Cell::Value(a.first_scalar()));
                    }
                }
            }
        }
    }

    fn drop_path_columns(&mut self) {
        self.path_columns.clear();
        for row in &mut self.rows {
            row.path.clear();
        }
    }
}

// ==================== QUERY ENGINE ====================

/// Path predicate: receives the decoded path of a group. Returning false
/// excludes the whole subtree before its children are visited.
/// The lifetime parameter lets callers pass closures borrowing local state.
pub type PathPredicate<'a> = dyn Fn(&Path) -> bool + 'a;

/// Data predicate: receives a dataset name and the path it lives at.
pub type DataPredicate<'a> = dyn Fn(&str, &Path) -> bool + 'a;

/// Depth-first recursive traversal. A group contributes a row iff at least
/// one of its leaves passes the data predicate (an absent predicate passes
/// every leaf); child results merge in as an outer join.
fn traverse(
    group: &GroupNode,
    path: &Path,
    path_pred: Option<&PathPredicate<'_>>,
    data_pred: Option<&DataPredicate<'_>>,
    info_only: bool,
) -> Result<RecordSet> {
    if let Some(pred) = path_pred {
        if !pred(path) {
            return Ok(RecordSet::default());
        }
    }

    let mut leaves = Vec::new();
    for (name, dataset) in &group.datasets {
        if data_pred.map_or(true, |pred| pred(name, path)) {
            let cell = if info_only {
                Cell::Info(dataset.info())
            } else {
                Cell::Value(dataset.to_value())
            };
            leaves.push((name.clone(), cell));
        }
    }

    let mut result = if leaves.is_empty() {
        RecordSet::default()
    } else {
        RecordSet::single(path, leaves)
    };

    for (segment, child) in &group.children {
        let (key, value) = split_segment(segment)?;
        let mut child_path = path.clone();
        child_path.insert(key, value)?;
        result.merge(traverse(child, &child_path, path_pred, data_pred, info_only)?);
    }

    Ok(result)
}

// ==================== RENDERER ====================

/// Indented tree rendering with run-length grouping: consecutive rows
/// sharing a path-key value share one `> key=value` heading; leaf lines
/// appear once the row's path columns are exhausted.
fn render(set: &RecordSet) -> String {
    let mut out = String::new();
    let rows: Vec<usize> = (0..set.rows.len()).collect();
    render_rows(set, &rows, 0, 0, &mut out);
    out
}

fn render_rows(set: &RecordSet, rows: &[usize], column: usize, indent: usize, out: &mut String) {
    if column == set.path_columns.len() {
        for &row in rows {
            render_leaves(set, row, indent, out);
        }
        return;
    }

    let key = &set.path_columns[column];
    let mut start = 0;
    while start < rows.len() {
        let value = &set.rows[rows[start]].path[column];
        let mut end = start + 1;
        while end < rows.len() && set.rows[rows[end]].path[column] == *value {
            end += 1;
        }
        match value {
            Some(v) => {
                out.push_str(&"  ".repeat(indent));
                out.push_str(&format!("> {}={}\n", key, v));
                render_rows(set, &rows[start..end], column + 1, indent + 1, out);
            }
            // Rows that never reached this dimension render at this depth.
            None => render_rows(set, &rows[start..end], column + 1, indent, out),
        }
        start = end;
    }
}

fn render_leaves(set: &RecordSet, row: usize, indent: usize, out: &mut String) {
    let mut leaves: Vec<(&String, &Cell)> = set
        .data_columns
        .iter()
        .zip(&set.rows[row].data)
        .filter_map(|(name, cell)| cell.as_ref().map(|c| (name, c)))
        .collect();
    leaves.sort_by(|a, b| a.0.cmp(b.0));
    for (name, cell) in leaves {
        let (shape, dtype) = match cell {
            Cell::Info(info) => (info.shape.clone(), info.dtype),
            Cell::Value(value) => (value.shape(), value.dtype()),
        };
        out.push_str(&"  ".repeat(indent));
        out.push_str(&format!("- {} (shape={:?}, dtype={})\n", name, shape, dtype));
    }
}

// ==================== STORE ====================

/// Write disposition for `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Replace an existing dataset, create otherwise.
    Overwrite,
    /// Create growable, extend along axis 0 if it already exists.
    Append,
    /// Create if missing, leave an existing dataset untouched.
    CreateIfAbsent,
}

impl FromStr for SetMode {
    type Err = NdStoreError;

    fn from_str(s: &str) -> Result<SetMode> {
        match s {
            "overwrite" => Ok(SetMode::Overwrite),
            "append" => Ok(SetMode::Append),
            "create-if-absent" => Ok(SetMode::CreateIfAbsent),
            other => Err(NdStoreError::validation(format!(
                "mode must be overwrite, append, or create-if-absent, got '{}'",
                other
            ))),
        }
    }
}

/// The store handle. Every public operation is one critical section:
/// acquire lock, open container, execute, save/close, release lock.
/// Independent handles on the same backing path never interleave.
#[derive(Debug, Clone)]
pub struct NdStore {
    path: PathBuf,
    lock: FileLock,
}

impl NdStore {
    /// Binds a store to a backing path. The container itself is created
    /// lazily by the first `set`.
    pub fn open(path: impl AsRef<StdPath>) -> Result<NdStore> {
        let path = std::path::absolute(path.as_ref())
            .io_context("resolving store path")?;
        Ok(NdStore {
            lock: FileLock::new(&path),
            path,
        })
    }

    pub fn path(&self) -> &StdPath {
        &self.path
    }

    /// Writes each named value under `path`. Keys apply one at a time:
    /// when a later key fails, keys already applied stay persisted.
    pub fn set(&self, data: BTreeMap<String, Value>, path: &Path, mode: SetMode) -> Result<()> {
        let location = path.location();
        self.lock.run_exclusive(|| {
            let mut container = Container::open(&self.path)?;
            let mut failure = None;
            for (name, value) in data {
                if let Err(e) = Self::apply_one(&mut container, &location, &name, value, mode) {
                    failure = Some(e);
                    break;
                }
            }
            match failure {
                // Keys applied before the failure still get persisted, but
                // the caller sees the write error, not a secondary save error.
                Some(e) => {
                    if let Err(save_err) = container.save() {
                        log::warn!(
                            "container save failed after write error: {}",
                            save_err
                        );
                    }
                    Err(e)
                }
                None => {
                    container.save()?;
                    Ok(())
                }
            }
        })
    }

    fn apply_one(
        container: &mut Container,
        location: &str,
        name: &str,
        value: Value,
        mode: SetMode,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(NdStoreError::validation("dataset name must not be empty"));
        }
        Container::ensure_compatible(&value)?;
        let exists = container
            .group_at(location)
            .map_or(false, |group| group.datasets.contains_key(name));
        match (exists, mode) {
            (false, SetMode::Append) => container.create(location, name, value, true),
            (false, _) => container.create(location, name, value, false),
            (true, SetMode::Overwrite) => container.replace(location, name, value),
            (true, SetMode::Append) => container.extend(location, name, value),
            (true, SetMode::CreateIfAbsent) => Ok(()),
        }
    }

    /// Queries the store into an aligned record set. `want_all` keeps the
    /// path-key columns alongside the data columns; `squeeze` collapses
    /// single-element cells to scalars.
    pub fn get(
        &self,
        path_pred: Option<&PathPredicate<'_>>,
        data_pred: Option<&DataPredicate<'_>>,
        want_all: bool,
        squeeze: bool,
    ) -> Result<RecordSet> {
        self.lock.run_exclusive(|| {
            let container = Container::open(&self.path)?;
            let mut set = traverse(&container.root, &Path::new(), path_pred, data_pred, false)?;
            if squeeze {
                set.squeeze();
            }
            if !want_all {
                set.drop_path_columns();
            }
            Ok(set)
        })
    }

    /// Keeps only the leaves matching `data_pred` (within subtrees matching
    /// `path_pred`); everything else is physically deleted and emptied
    /// groups are pruned. An absent data predicate keeps everything.
    pub fn filter(
        &self,
        path_pred: Option<&PathPredicate<'_>>,
        data_pred: Option<&DataPredicate<'_>>,
    ) -> Result<()> {
        let keep = match data_pred {
            Some(pred) => pred,
            None => return Ok(()),
        };
        let doomed = |name: &str, path: &Path| !keep(name, path);
        self.lock.run_exclusive(|| {
            let mut container = Container::open(&self.path)?;
            let set = traverse(&container.root, &Path::new(), path_pred, Some(&doomed), true)?;
            let mut removed = 0usize;
            for row in 0..set.rows.len() {
                // A row's non-null path cells are exactly its origin path.
                let mut path = Path::new();
                for (key, cell) in set.path_columns.iter().zip(&set.rows[row].path) {
                    if let Some(value) = cell {
                        path.insert(key.clone(), value.clone())?;
                    }
                }
                let location = path.location();
                for (name, cell) in set.data_columns.iter().zip(&set.rows[row].data) {
                    if cell.is_some() {
                        container.delete(&location, name)?;
                        removed += 1;
                    }
                }
            }
            container.prune_empty();
            if removed > 0 {
                log::debug!(
                    "filter removed {} datasets from {}",
                    removed,
                    container.path.display()
                );
            }
            container.save()?;
            Ok(())
        })
    }

    /// Renders the matching part of the store as an indented tree.
    pub fn show(
        &self,
        path_pred: Option<&PathPredicate<'_>>,
        data_pred: Option<&DataPredicate<'_>>,
    ) -> Result<String> {
        self.lock.run_exclusive(|| {
            let container = Container::open(&self.path)?;
            let set = traverse(&container.root, &Path::new(), path_pred, data_pred, true)?;
            Ok(render(&set))
        })
    }

    /// Sorted distinct path keys present anywhere in the store.
    pub fn index_keys(&self) -> Result<Vec<String>> {
        self.lock.run_exclusive(|| {
            let container = Container::open(&self.path)?;
            let set = traverse(&container.root, &Path::new(), None, None, true)?;
            let mut keys = set.path_columns.clone();
            keys.sort();
            Ok(keys)
        })
    }

    /// Sorted distinct values observed for one path key.
    pub fn index_values(&self, key: &str) -> Result<Vec<String>> {
        self.lock.run_exclusive(|| {
            let container = Container::open(&self.path)?;
            let set = traverse(&container.root, &Path::new(), None, None, true)?;
            let mut values: Vec<String> = Vec::new();
            for row in 0..set.rows.len() {
                if let Some(value) = set.path_value(row, key) {
                    if !values.iter().any(|v| v == value) {
                        values.push(value.to_string());
                    }
                }
            }
            values.sort();
            Ok(values)
        })
    }

    /// Sorted distinct dataset names present anywhere in the store.
    pub fn col_keys(&self) -> Result<Vec<String>> {
        self.lock.run_exclusive(|| {
            let container = Container::open(&self.path)?;
            let set = traverse(&container.root, &Path::new(), None, None, true)?;
            let mut names = set.data_columns.clone();
            names.sort();
            Ok(names)
        })
    }
}

// ==================== UNIT TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("store.ndjson")
    }

    // ---- path codec ----

    #[test]
    fn test_location_sorts_keys() {
        let path = Path::from_pairs([("k2", "b"), ("k1", "a")]).unwrap();
        assert_eq!(path.location(), "k1=a/k2=b");
    }

    #[test]
    fn test_empty_path_is_root() {
        assert_eq!(Path::new().location(), "");
        assert!(Path::parse("").unwrap().is_empty());
        assert!(Path::parse("/").unwrap().is_empty());
    }

    #[test]
    fn test_parse_round_trip() {
        let path = Path::from_pairs([("i1", "3"), ("i2", "4")]).unwrap();
        let parsed = Path::parse(&path.location()).unwrap();
        assert_eq!(parsed, path);
    }

    #[test]
    fn test_distinct_paths_distinct_locations() {
        let p1 = Path::from_pairs([("a", "1"), ("b", "2")]).unwrap();
        let p2 = Path::from_pairs([("a", "2"), ("b", "1")]).unwrap();
        assert_ne!(p1.location(), p2.location());
    }

    #[test]
    fn test_parse_normalizes_dashes() {
        let parsed = Path::parse("my-key=1").unwrap();
        assert_eq!(parsed.get("my_key"), Some("1"));
    }

    #[test]
    fn test_insert_rejects_forbidden_characters() {
        assert!(Path::new().insert("a=b", "1").is_err());
        assert!(Path::new().insert("a/b", "1").is_err());
        assert!(Path::new().insert("a,b", "1").is_err());
        assert!(Path::new().insert("a", "1/2").is_err());
        assert!(Path::new().insert("", "1").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_segments() {
        assert!(Path::parse("novalue").is_err());
        assert!(Path::parse("a=1=2").is_err());
        assert!(Path::parse("a=1/a=2").is_err());
    }

    // ---- values and datasets ----

    #[test]
    fn test_array_value_shape_check() {
        assert!(ArrayValue::new(vec![2, 3], DataBuf::Float(vec![0.0; 6])).is_ok());
        assert!(ArrayValue::new(vec![2, 3], DataBuf::Float(vec![0.0; 5])).is_err());
    }

    #[test]
    fn test_dataset_append_grows_axis_zero() {
        let mut ds = Dataset::from_value(Value::from(vec![2.3]), true);
        ds.extend("d", Value::from(vec![3.0])).unwrap();
        ds.extend("d", Value::from(vec![4.0])).unwrap();
        assert_eq!(ds.shape, vec![3]);
        assert_eq!(ds.data, DataBuf::Float(vec![2.3, 3.0, 4.0]));
    }

    #[test]
    fn test_dataset_append_scalar_normalizes() {
        let mut ds = Dataset::from_value(Value::Float(1.0), true);
        assert_eq!(ds.shape, vec![1]);
        ds.extend("d", Value::Float(2.0)).unwrap();
        assert_eq!(ds.shape, vec![2]);
    }

    #[test]
    fn test_dataset_append_shape_mismatch() {
        let arr = ArrayValue::new(vec![1, 3], DataBuf::Float(vec![0.0; 3])).unwrap();
        let mut ds = Dataset::from_value(Value::Array(arr), true);
        let bad = ArrayValue::new(vec![1, 4], DataBuf::Float(vec![0.0; 4])).unwrap();
        let err = ds.extend("d", Value::Array(bad)).unwrap_err();
        assert!(matches!(err, NdStoreError::ShapeMismatch { .. }));
        assert_eq!(ds.shape, vec![1, 3]);
    }

    #[test]
    fn test_dataset_append_dtype_mismatch() {
        let mut ds = Dataset::from_value(Value::from(vec![1.0]), true);
        assert!(ds.extend("d", Value::from(vec![1i64])).is_err());
    }

    #[test]
    fn test_dataset_not_growable() {
        let mut ds = Dataset::from_value(Value::from(vec![1.0]), false);
        assert!(ds.extend("d", Value::from(vec![2.0])).is_err());
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        assert!(Container::ensure_compatible(&Value::Float(f64::NAN)).is_err());
        assert!(Container::ensure_compatible(&Value::Float(f64::INFINITY)).is_err());
        let arr =
            ArrayValue::new(vec![2], DataBuf::Float(vec![1.0, f64::NEG_INFINITY])).unwrap();
        assert!(Container::ensure_compatible(&Value::Array(arr)).is_err());
        assert!(Container::ensure_compatible(&Value::Float(1.0)).is_ok());
        assert!(Container::ensure_compatible(&Value::from(vec![1.0, 2.0])).is_ok());
    }

    // ---- record set ----

    #[test]
    fn test_merge_pads_with_nulls() {
        let p1 = Path::from_pairs([("k", "1")]).unwrap();
        let p2 = Path::from_pairs([("k", "2"), ("m", "x")]).unwrap();
        let mut set = RecordSet::single(&p1, vec![("a".to_string(), Cell::Value(Value::Int(1)))]);
        set.merge(RecordSet::single(
            &p2,
            vec![("b".to_string(), Cell::Value(Value::Int(2)))],
        ));

        assert_eq!(set.len(), 2);
        assert_eq!(set.path_columns(), ["k", "m"]);
        assert_eq!(set.data_columns(), ["a", "b"]);
        assert_eq!(set.path_value(0, "k"), Some("1"));
        assert_eq!(set.path_value(0, "m"), None);
        assert_eq!(set.data_value(0, "b"), None);
        assert_eq!(set.path_value(1, "m"), Some("x"));
        assert_eq!(set.data_value(1, "b"), Some(&Cell::Value(Value::Int(2))));
        assert_eq!(set.data_value(1, "a"), None);
    }

    #[test]
    fn test_squeeze_collapses_single_element_arrays() {
        let path = Path::new();
        let mut set = RecordSet::single(
            &path,
            vec![
                ("one".to_string(), Cell::Value(Value::from(vec![5.0]))),
                ("two".to_string(), Cell::Value(Value::from(vec![1.0, 2.0]))),
            ],
        );
        set.squeeze();
        assert_eq!(set.data_value(0, "one"), Some(&Cell::Value(Value::Float(5.0))));
        assert_eq!(
            set.data_value(0, "two"),
            Some(&Cell::Value(Value::from(vec![1.0, 2.0])))
        );
    }

    // ---- renderer ----

    #[test]
    fn test_render_run_length_grouping() {
        let mut set = RecordSet::default();
        for (k, m) in [("1", "a"), ("1", "b"), ("2", "a")] {
            let path = Path::from_pairs([("k", k), ("m", m)]).unwrap();
            set.merge(RecordSet::single(
                &path,
                vec![(
                    "d".to_string(),
                    Cell::Info(DatasetInfo { shape: vec![1], dtype: Dtype::Float64 }),
                )],
            ));
        }
        let text = render(&set);
        let expected = "\
> k=1
  > m=a
    - d (shape=[1], dtype=float64)
  > m=b
    - d (shape=[1], dtype=float64)
> k=2
  > m=a
    - d (shape=[1], dtype=float64)
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_render_root_leaves() {
        let set = RecordSet::single(
            &Path::new(),
            vec![(
                "z".to_string(),
                Cell::Info(DatasetInfo { shape: vec![], dtype: Dtype::Int64 }),
            )],
        );
        assert_eq!(render(&set), "- z (shape=[], dtype=int64)\n");
    }

    // ---- lock ----

    #[test]
    fn test_lock_guard_releases_on_drop() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);
        let lock_file = dir.path().join("store.ndjson.lock");
        let lock = FileLock::new(&path);

        let guard = lock.acquire().unwrap();
        assert!(lock_file.exists());
        drop(guard);
        assert!(!lock_file.exists());

        // Reacquirable immediately after release.
        let guard = lock.acquire().unwrap();
        drop(guard);
    }

    #[test]
    fn test_lock_released_after_operation_error() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(store_path(&dir));

        let result: Result<()> =
            lock.run_exclusive(|| Err(NdStoreError::validation("boom")));
        assert!(result.is_err());

        // Error path must not leave the lock held.
        lock.run_exclusive(|| Ok(())).unwrap();
    }

    #[test]
    fn test_lock_timeout_while_held() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(store_path(&dir));

        let _guard = lock.acquire().unwrap();
        let err = lock
            .run_exclusive_timeout(Duration::from_millis(250), || Ok(()))
            .unwrap_err();
        assert!(matches!(err, NdStoreError::Timeout { .. }));
    }

    #[test]
    fn test_lock_mutual_exclusion_across_threads() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = FileLock::new(&path);
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    lock.run_exclusive(|| {
                        let seen = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        // Nobody else may enter while we hold the lock.
                        thread::sleep(Duration::from_millis(1));
                        assert_eq!(
                            counter.load(std::sync::atomic::Ordering::SeqCst),
                            seen + 1
                        );
                        counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_lock_survives_sentinel_replacement() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);
        fs::write(&path, b"").unwrap();

        // Race acquisition against an atomic-rename writer replacing the
        // sentinel, the way a concurrent holder's save does.
        let target = path.clone();
        let replacer = thread::spawn(move || {
            let tmp = target.with_file_name("store.ndjson.tmp");
            for _ in 0..500 {
                fs::write(&tmp, b"").unwrap();
                fs::rename(&tmp, &target).unwrap();
            }
        });

        let lock = FileLock::new(&path);
        for _ in 0..200 {
            lock.run_exclusive(|| Ok(())).unwrap();
        }
        replacer.join().unwrap();
    }

    // ---- container ----

    #[test]
    fn test_container_save_and_reopen() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);

        let mut container = Container::open(&path).unwrap();
        container
            .create("k=1", "d", Value::from(vec![1.0, 2.0]), false)
            .unwrap();
        container.save().unwrap();

        let reopened = Container::open(&path).unwrap();
        let group = reopened.group_at("k=1").unwrap();
        assert_eq!(group.datasets["d"].shape, vec![2]);
    }

    #[test]
    fn test_container_open_empty_file() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);
        fs::write(&path, b"").unwrap();
        let container = Container::open(&path).unwrap();
        assert!(container.root.is_empty());
    }

    #[test]
    fn test_container_open_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = store_path(&dir);
        fs::write(&path, b"not json at all").unwrap();
        let err = Container::open(&path).unwrap_err();
        assert!(matches!(err, NdStoreError::Corrupt { .. }));
    }

    #[test]
    fn test_save_failure_cleans_up_tmp() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("store.ndjson");
        // A directory at the target makes the rename fail.
        fs::create_dir(&target).unwrap();

        let container = Container {
            path: target,
            root: GroupNode::default(),
        };
        let err = container.save().unwrap_err();
        assert!(matches!(err, NdStoreError::Io { .. }));
        assert!(!dir.path().join("store.ndjson.tmp").exists());
    }

    #[test]
    fn test_prune_removes_empty_chains() {
        let dir = tempdir().unwrap();
        let mut container = Container::open(&store_path(&dir)).unwrap();
        container
            .create("a=1/b=2", "d", Value::Int(1), false)
            .unwrap();
        container.create("a=1", "e", Value::Int(2), false).unwrap();

        container.delete("a=1/b=2", "d").unwrap();
        container.prune_empty();

        assert!(container.group_at("a=1/b=2").is_none());
        assert!(container.group_at("a=1").is_some());
    }

    // ---- modes ----

    #[test]
    fn test_mode_from_str() {
        assert_eq!("overwrite".parse::<SetMode>().unwrap(), SetMode::Overwrite);
        assert_eq!("append".parse::<SetMode>().unwrap(), SetMode::Append);
        assert_eq!(
            "create-if-absent".parse::<SetMode>().unwrap(),
            SetMode::CreateIfAbsent
        );
        assert!("upsert".parse::<SetMode>().is_err());
    }
}
