// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Error, Store};

/// A thread-safe `HashMap` wrapper. Used as the database backend in tests and
/// for ephemeral runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryDB {
    db: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl Store for MemoryDB {
    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.db.read().get(key.as_ref()).cloned())
    }

    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.db
            .write()
            .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        Ok(())
    }

    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
    {
        self.db.write().remove(key.as_ref());
        Ok(())
    }

    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.db.read().contains_key(key.as_ref()))
    }

    fn bulk_write<K, V>(&self, values: &[(K, V)]) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        // Single lock acquisition so readers never observe a partial group.
        let mut db = self.db.write();
        for (k, v) in values {
            db.insert(k.as_ref().to_vec(), v.as_ref().to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_delete() {
        let db = MemoryDB::default();
        db.write(b"a", b"1").unwrap();
        assert_eq!(db.read(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(db.exists(b"a").unwrap());
        db.delete(b"a").unwrap();
        assert_eq!(db.read(b"a").unwrap(), None);
        assert!(!db.exists(b"a").unwrap());
    }

    #[test]
    fn bulk_write_lands_together() {
        let db = MemoryDB::default();
        let kvs: Vec<(Vec<u8>, Vec<u8>)> = (0u8..10)
            .map(|i| (vec![i], vec![i, i]))
            .collect();
        db.bulk_write(&kvs).unwrap();
        for (k, v) in &kvs {
            assert_eq!(db.read(k).unwrap().as_deref(), Some(v.as_slice()));
        }
    }
}
