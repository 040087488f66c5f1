// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::Path;
use std::sync::Arc;

use parity_db::{Db, Options};

use super::{Error, Store};

const COLUMN: u8 = 0;

/// On-disk database backend. A single column is used; namespaces are encoded
/// in key prefixes. `parity-db` commits are atomic, which is what
/// [`Store::bulk_write`] relies on for slot updates.
#[derive(Clone)]
pub struct ParityDb {
    db: Arc<Db>,
}

impl ParityDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let opts = Options::with_columns(path, 1);
        Ok(Self {
            db: Arc::new(Db::open_or_create(&opts)?),
        })
    }
}

impl Store for ParityDb {
    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>,
    {
        self.db.get(COLUMN, key.as_ref()).map_err(Error::from)
    }

    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let tx = [(COLUMN, key.as_ref(), Some(value.as_ref().to_owned()))];
        self.db.commit(tx).map_err(Error::from)
    }

    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
    {
        let tx = [(COLUMN, key.as_ref(), None)];
        self.db.commit(tx).map_err(Error::from)
    }

    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
    {
        self.db
            .get_size(COLUMN, key.as_ref())
            .map(|size| size.is_some())
            .map_err(Error::from)
    }

    fn bulk_write<K, V>(&self, values: &[(K, V)]) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let tx = values
            .iter()
            .map(|(k, v)| (COLUMN, k.as_ref(), Some(v.as_ref().to_owned())))
            .collect::<Vec<_>>();

        self.db.commit(tx).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let db = ParityDb::open(dir.path()).unwrap();
        db.write(b"trust/xyz", b"payload").unwrap();
        assert_eq!(db.read(b"trust/xyz").unwrap(), Some(b"payload".to_vec()));
        db.delete(b"trust/xyz").unwrap();
        assert_eq!(db.read(b"trust/xyz").unwrap(), None);
    }

    #[test]
    fn bulk_write_group() {
        let dir = tempfile::tempdir().unwrap();
        let db = ParityDb::open(dir.path()).unwrap();
        let kvs: Vec<(Vec<u8>, Vec<u8>)> = (0u8..4).map(|i| (vec![i], vec![i; 8])).collect();
        db.bulk_write(&kvs).unwrap();
        for (k, v) in &kvs {
            assert_eq!(db.read(k).unwrap().as_deref(), Some(v.as_slice()));
        }
    }
}
