//! Document store collaborator.
//!
//! A document store offers three operations: insert one document, delete every
//! document matching a filter, and find documents (filtered and sorted) through
//! a cursor callback. There is no multi-statement transaction, which is why the
//! document migrator cannot roll anything back.
//!
//! [`RedisDocumentStore`] keeps each collection as a Redis list of JSON
//! documents under `{namespace}:{collection}`.

use crate::config::DocumentStoreConfig;
use crate::executor::StoreError;
use redis::Commands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Mutex;

/// A JSON document
pub type Document = Map<String, Value>;

/// Serialize any value into a [`Document`]
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the value does not serialize, or
/// `StoreError::Parse` if it serializes to something other than a JSON object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Parse(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Equality filter: a document matches when every field in the filter is
/// present in the document with an equal value. The empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: Document,
}

impl Filter {
    /// Matches every document
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches documents whose `field` equals `value`
    pub fn matching(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    /// Add another equality condition
    #[must_use]
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Options for [`DocumentStore::find`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    sort: Vec<(String, SortOrder)>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort by `field`; earlier calls take precedence over later ones
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn sort_keys(&self) -> &[(String, SortOrder)] {
        &self.sort
    }

    /// Order `documents` in place according to the sort keys
    pub fn apply(&self, documents: &mut [Document]) {
        if self.sort.is_empty() {
            return;
        }
        documents.sort_by(|a, b| {
            for (field, order) in &self.sort {
                let ordering = compare_values(a.get(field), b.get(field));
                let ordering = match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
}

/// Missing < null < bool < number < string; other types compare equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Forward-only cursor over the documents returned by `find`
#[derive(Debug)]
pub struct DocumentCursor {
    documents: std::vec::IntoIter<Document>,
}

impl DocumentCursor {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: documents.into_iter(),
        }
    }

    /// Advance and decode the next document into `T`
    ///
    /// Returns `None` once the cursor is exhausted.
    pub fn next_decoded<T: DeserializeOwned>(&mut self) -> Option<Result<T, StoreError>> {
        self.documents
            .next()
            .map(|document| serde_json::from_value(Value::Object(document)).map_err(StoreError::from))
    }
}

impl Iterator for DocumentCursor {
    type Item = Document;

    fn next(&mut self) -> Option<Self::Item> {
        self.documents.next()
    }
}

/// Callback handed to [`DocumentStore::find`]. It receives either a cursor or
/// the error that prevented one from being produced.
pub type FindCallback<'a> =
    dyn FnMut(Result<DocumentCursor, StoreError>) -> Result<(), StoreError> + 'a;

/// Document store collaborator
pub trait DocumentStore {
    /// Insert a single document into `collection`
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write fails.
    fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Delete every document in `collection` matching `filter`, returning how many were removed
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the delete fails.
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Find documents and pass them to `callback` through a cursor
    ///
    /// Read failures are delivered to the callback as `Err`; whatever the
    /// callback returns is returned from `find`.
    ///
    /// # Errors
    ///
    /// Returns the callback's error.
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
        callback: &mut FindCallback<'_>,
    ) -> Result<(), StoreError>;
}

/// `DocumentStore` backed by Redis lists of JSON documents
pub struct RedisDocumentStore {
    conn: Mutex<redis::Connection>,
    namespace: String,
}

impl RedisDocumentStore {
    /// Create a new store with the given connection and key namespace.
    pub fn new(conn: redis::Connection, namespace: impl Into<String>) -> Self {
        Self {
            conn: Mutex::new(conn),
            namespace: namespace.into(),
        }
    }

    /// Open a connection to `url` and create a store over it.
    ///
    /// # Example
    /// ```no_run
    /// use driftguard::document::RedisDocumentStore;
    ///
    /// let store = RedisDocumentStore::connect("redis://localhost:6379", "myapp")?;
    /// # Ok::<(), driftguard::StoreError>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Redis` if the URL is invalid or the server is unreachable.
    pub fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self::new(conn, namespace))
    }

    /// Connect using the `[document_store]` section of the configuration.
    ///
    /// # Errors
    ///
    /// Same as [`RedisDocumentStore::connect`].
    pub fn from_config(config: &DocumentStoreConfig) -> Result<Self, StoreError> {
        log::debug!("connecting document store with namespace {}", config.namespace);
        Self::connect(&config.url, config.namespace.clone())
    }

    /// Get the key namespace used by this store.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, collection: &str) -> String {
        format!("{}:{}", self.namespace, collection)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Other(format!("Failed to lock redis connection: {e}")))?;
        f(&mut conn)
    }

    /// Raw JSON entries of a collection, in insertion order
    fn load_raw(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| conn.lrange::<_, Vec<String>>(key, 0, -1).map_err(StoreError::from))
    }
}

fn parse_document(raw: &str) -> Result<Document, StoreError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Parse(format!(
            "stored entry is not a JSON object: {other}"
        ))),
    }
}

impl DocumentStore for RedisDocumentStore {
    fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let key = self.key(collection);
        let json = serde_json::to_string(&document)?;
        self.with_conn(|conn| {
            conn.rpush::<_, _, ()>(&key, json)?;
            Ok(())
        })
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let key = self.key(collection);

        if filter.is_empty() {
            let removed = self.with_conn(|conn| {
                let len: u64 = conn.llen(&key)?;
                conn.del::<_, ()>(&key)?;
                Ok(len)
            })?;
            return Ok(removed);
        }

        let mut matching = Vec::new();
        for raw in self.load_raw(&key)? {
            if filter.matches(&parse_document(&raw)?) {
                matching.push(raw);
            }
        }
        matching.sort();
        matching.dedup();

        self.with_conn(|conn| {
            let mut removed = 0u64;
            for raw in &matching {
                let count: i64 = conn.lrem(&key, 0, raw)?;
                removed += u64::try_from(count).unwrap_or(0);
            }
            Ok(removed)
        })
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
        callback: &mut FindCallback<'_>,
    ) -> Result<(), StoreError> {
        let key = self.key(collection);

        let loaded = self.load_raw(&key).and_then(|entries| {
            let mut documents = Vec::with_capacity(entries.len());
            for raw in entries {
                let document = parse_document(&raw)?;
                if filter.matches(&document) {
                    documents.push(document);
                }
            }
            Ok(documents)
        });

        match loaded {
            Ok(mut documents) => {
                options.apply(&mut documents);
                callback(Ok(DocumentCursor::new(documents)))
            }
            Err(e) => callback(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_from_config_rejects_invalid_url() {
        let config = DocumentStoreConfig {
            url: "not a redis url".to_string(),
            namespace: "app".to_string(),
        };
        assert!(matches!(
            RedisDocumentStore::from_config(&config),
            Err(StoreError::Redis(_))
        ));
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_filter_matching() {
        let d = doc(json!({"version": 3, "name": "init"}));

        assert!(Filter::all().matches(&d));
        assert!(Filter::matching("version", 3).matches(&d));
        assert!(!Filter::matching("version", 4).matches(&d));
        assert!(Filter::matching("version", 3).and("name", "init").matches(&d));
        assert!(!Filter::matching("missing", 1).matches(&d));
    }

    #[test]
    fn test_sort_descending_by_number() {
        let mut docs = vec![
            doc(json!({"version": 2})),
            doc(json!({"version": 10})),
            doc(json!({"version": 1})),
        ];
        FindOptions::new()
            .sort_by("version", SortOrder::Descending)
            .apply(&mut docs);

        let versions: Vec<i64> = docs.iter().map(|d| d["version"].as_i64().unwrap()).collect();
        assert_eq!(versions, vec![10, 2, 1]);
    }

    #[test]
    fn test_sort_missing_field_first_when_ascending() {
        let mut docs = vec![doc(json!({"version": 1})), doc(json!({"other": true}))];
        FindOptions::new()
            .sort_by("version", SortOrder::Ascending)
            .apply(&mut docs);
        assert!(docs[0].get("version").is_none());
    }

    #[test]
    fn test_cursor_decodes_documents() {
        #[derive(Deserialize)]
        struct Row {
            version: i64,
        }

        let mut cursor = DocumentCursor::new(vec![doc(json!({"version": 5})), doc(json!({"version": "x"}))]);
        let first: Row = cursor.next_decoded().unwrap().unwrap();
        assert_eq!(first.version, 5);
        assert!(cursor.next_decoded::<Row>().unwrap().is_err());
        assert!(cursor.next_decoded::<Row>().is_none());
    }

    #[test]
    fn test_to_document_rejects_scalars() {
        assert!(to_document(&json!({"version": 1})).is_ok());
        assert!(matches!(to_document(&5), Err(StoreError::Parse(_))));
    }
}
