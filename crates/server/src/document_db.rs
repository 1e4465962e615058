//! In-process document database backing the document storage mode.
//!
//! Collections hold JSON objects keyed by their `_id`. Reads are lock free; writes
//! are serialized per collection so unique index checks and conditional updates
//! are atomic.

use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

pub type Document = Map<String, Value>;

pub const ID_KEY: &str = "_id";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("duplicate key for unique index {0}")]
    DuplicateKey(String),
    #[error("document has no `_id` string")]
    MissingId,
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("document serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(key.into(), value.into())
    }

    pub fn id(id: &str) -> Self {
        Filter::eq(ID_KEY, id)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(key, value) => doc.get(key) == Some(value),
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
            Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Serializes `value` into a document carrying `_id`.
pub fn to_document<T: serde::Serialize>(id: &str, value: &T) -> Result<Document, DocumentError> {
    match serde_json::to_value(value)? {
        Value::Object(mut doc) => {
            doc.insert(ID_KEY.to_string(), Value::from(id));
            Ok(doc)
        }
        _ => Err(DocumentError::NotAnObject),
    }
}

pub fn from_document<T: serde::de::DeserializeOwned>(mut doc: Document) -> Result<T, DocumentError> {
    doc.remove(ID_KEY);
    Ok(serde_json::from_value(Value::Object(doc))?)
}

#[derive(Debug)]
pub struct Collection {
    name: String,
    documents: DashMap<String, Document>,
    unique_indexes: RwLock<Vec<Vec<String>>>,
    writes: Mutex<()>,
}

impl Collection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            documents: DashMap::new(),
            unique_indexes: RwLock::new(Vec::new()),
            writes: Mutex::new(()),
        }
    }

    /// Documents missing any indexed key, or holding null there, are not indexed.
    pub fn create_unique_index(&self, fields: &[&str]) {
        let mut indexes = self
            .unique_indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        if !indexes.contains(&fields) {
            indexes.push(fields);
        }
    }

    pub fn insert_one(&self, doc: Document) -> Result<(), DocumentError> {
        let id = document_id(&doc)?;
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if self.documents.contains_key(&id) {
            return Err(DocumentError::DuplicateKey(format!("{}.{ID_KEY}", self.name)));
        }
        self.check_unique(&id, &doc)?;
        self.documents.insert(id, doc);
        Ok(())
    }

    pub fn find_one(&self, filter: &Filter) -> Option<Document> {
        self.documents
            .iter()
            .find(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
    }

    pub fn find(&self, filter: &Filter) -> Vec<Document> {
        self.documents
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Replaces the first match, keeping its `_id`.
    pub fn replace_one(&self, filter: &Filter, mut doc: Document) -> Result<u64, DocumentError> {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = self.first_match(filter) else {
            return Ok(0);
        };
        doc.insert(ID_KEY.to_string(), Value::from(id.clone()));
        self.check_unique(&id, &doc)?;
        self.documents.insert(id, doc);
        Ok(1)
    }

    /// Merges `set` into the first match. The match and the write happen under one
    /// lock, so a filter on the current value acts as a compare-and-set.
    pub fn update_one(&self, filter: &Filter, set: Document) -> Result<u64, DocumentError> {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = self.first_match(filter) else {
            return Ok(0);
        };
        let Some(mut doc) = self.documents.get(&id).map(|d| d.value().clone()) else {
            return Ok(0);
        };
        for (key, value) in set {
            if key != ID_KEY {
                doc.insert(key, value);
            }
        }
        self.check_unique(&id, &doc)?;
        self.documents.insert(id, doc);
        Ok(1)
    }

    pub fn delete_one(&self, filter: &Filter) -> u64 {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        match self.first_match(filter) {
            Some(id) => self.documents.remove(&id).map_or(0, |_| 1),
            None => 0,
        }
    }

    pub fn delete_many(&self, filter: &Filter) -> u64 {
        let _guard = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = self
            .documents
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter(|id| self.documents.remove(*id).is_some())
            .count() as u64
    }

    fn first_match(&self, filter: &Filter) -> Option<String> {
        self.documents
            .iter()
            .find(|entry| filter.matches(entry.value()))
            .map(|entry| entry.key().clone())
    }

    fn check_unique(&self, id: &str, doc: &Document) -> Result<(), DocumentError> {
        let indexes = self
            .unique_indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for fields in indexes.iter() {
            let Some(key) = index_key(fields, doc) else {
                continue;
            };
            let taken = self.documents.iter().any(|entry| {
                entry.key() != id && index_key(fields, entry.value()).as_ref() == Some(&key)
            });
            if taken {
                return Err(DocumentError::DuplicateKey(format!(
                    "{}.{}",
                    self.name,
                    fields.join("+")
                )));
            }
        }
        Ok(())
    }
}

fn document_id(doc: &Document) -> Result<String, DocumentError> {
    doc.get(ID_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(DocumentError::MissingId)
}

fn index_key(fields: &[String], doc: &Document) -> Option<Vec<Value>> {
    fields
        .iter()
        .map(|f| doc.get(f).filter(|v| !v.is_null()).cloned())
        .collect()
}

/// A set of named collections shared by every store handle.
#[derive(Debug, Clone, Default)]
pub struct DocumentDatabase {
    collections: Arc<DashMap<String, Arc<Collection>>>,
}

impl DocumentDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Arc<Collection> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collection::new(name)))
            .value()
            .clone()
    }
}
