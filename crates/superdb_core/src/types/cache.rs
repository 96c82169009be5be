use std::sync::Arc;

use superdb_error::Result;

use super::{ID_TYPE_COMPLEX, PrimitiveType, Type};

/// Anything that can map a numeric type id to a type.
pub trait TypeFetcher: Send + Sync {
    fn lookup_type(&self, id: u32) -> Result<Type>;
}

/// Dense, unsynchronized `id -> type` cache in front of a [`TypeFetcher`].
///
/// Owned by a single worker, so hits never take a lock.
pub struct TypeCache {
    fetcher: Arc<dyn TypeFetcher>,
    types: Vec<Option<Type>>,
}

impl TypeCache {
    pub fn new(fetcher: Arc<dyn TypeFetcher>) -> Self {
        TypeCache {
            fetcher,
            types: Vec::new(),
        }
    }

    pub fn reset(&mut self, fetcher: Arc<dyn TypeFetcher>) {
        self.fetcher = fetcher;
        self.types.clear();
    }

    pub fn lookup(&mut self, id: u32) -> Result<Type> {
        if id < ID_TYPE_COMPLEX {
            if let Some(p) = PrimitiveType::from_id(id) {
                return Ok(Type::Primitive(p));
            }
        }
        let idx = id as usize;
        if let Some(Some(typ)) = self.types.get(idx) {
            return Ok(typ.clone());
        }
        let typ = self.fetcher.lookup_type(id)?;
        if idx >= self.types.len() {
            self.types.resize(idx + 1, None);
        }
        self.types[idx] = Some(typ.clone());
        Ok(typ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeContext;

    #[test]
    fn caches_and_resets() {
        let ctx = Arc::new(TypeContext::new());
        let arr = ctx.lookup_array(&Type::INT64);
        let mut cache = TypeCache::new(ctx.clone());
        assert_eq!(arr, cache.lookup(arr.id()).unwrap());
        assert_eq!(arr, cache.lookup(arr.id()).unwrap());
        assert_eq!(Type::STRING, cache.lookup(25).unwrap());

        let other = Arc::new(TypeContext::new());
        cache.reset(other);
        assert!(cache.lookup(arr.id()).is_err());
    }
}
