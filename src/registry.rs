//! Type-tag dispatch for the merge path.
//!
//! Values arrive from peers as opaque payload bytes plus a tag. Each value
//! type used with the store registers a handler under a stable tag at
//! startup; applying an incoming item looks the handler up by the tag carried
//! on the wire and merges at the byte level.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{decode, encode, Mergeable, Relationship, VersionHash};

/// Result of a byte-level merge: the winning payload plus the metadata the
/// store needs without decoding the value again.
pub(crate) struct MergedBytes {
    pub data: Vec<u8>,
    pub relationship: Relationship,
    pub value_hash: VersionHash,
    pub can_delete: bool,
}

pub(crate) trait TypeHandler: Send + Sync {
    /// Merge `incoming` against the stored payload, if any. The relationship
    /// classifies `incoming` relative to `current`.
    fn merge(&self, incoming: &[u8], current: Option<&[u8]>) -> Result<MergedBytes>;
}

struct Typed<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypeHandler for Typed<T>
where
    T: Mergeable + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn merge(&self, incoming: &[u8], current: Option<&[u8]>) -> Result<MergedBytes> {
        let new: T = decode(incoming)?;
        match current {
            None => Ok(MergedBytes {
                data: incoming.to_vec(),
                relationship: Relationship::Greater,
                value_hash: new.version_hash(),
                can_delete: new.can_delete(),
            }),
            Some(current) => {
                let old: T = decode(current)?;
                let (merged, relationship) = new.merge_with(&old);
                let data = match relationship {
                    Relationship::Less | Relationship::Equal => current.to_vec(),
                    Relationship::Greater | Relationship::Conflict => encode(&merged)?,
                };
                Ok(MergedBytes {
                    data,
                    relationship,
                    value_hash: merged.version_hash(),
                    can_delete: merged.can_delete(),
                })
            }
        }
    }
}

/// Tag → handler table, populated once at startup per value type used.
pub struct Registry {
    handlers: RwLock<HashMap<String, Arc<dyn TypeHandler>>>,
    tags: RwLock<HashMap<TypeId, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
        }
    }

    /// Register `T` under `tag`. Registering the same pair twice is a no-op;
    /// rebinding a tag to a different type is an error.
    pub fn register<T>(&self, tag: &str) -> Result<()>
    where
        T: Mergeable + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if tag.trim().is_empty() {
            return Err(Error::InvalidArgument("type tag must not be blank".into()));
        }
        let type_id = TypeId::of::<T>();
        let mut tags = self.tags.write().expect("registry lock poisoned");
        if let Some(existing) = tags.get(&type_id) {
            if existing == tag {
                return Ok(());
            }
            return Err(Error::TagConflict { tag: tag.into() });
        }
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        if handlers.contains_key(tag) {
            return Err(Error::TagConflict { tag: tag.into() });
        }
        handlers.insert(
            tag.to_string(),
            Arc::new(Typed::<T> {
                _marker: PhantomData,
            }),
        );
        tags.insert(type_id, tag.to_string());
        Ok(())
    }

    pub(crate) fn handler(&self, tag: &str) -> Result<Arc<dyn TypeHandler>> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::UnknownTag(tag.to_string()))
    }

    pub(crate) fn tag_of<T: 'static>(&self) -> Result<String> {
        self.tags
            .read()
            .expect("registry lock poisoned")
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| Error::UnknownTag(std::any::type_name::<T>().to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
