//! Typed handle over [`HashDb`].

use std::path::Path;

use hashkeep_core::{ErrorCode, HashDb, HdbError, OpenMode, Tuning};

use crate::error::{TypedError, TypedResult};
use crate::value::Value;

/// Database whose values are [`Value`]s.
///
/// Keys stay raw bytes. Every value is stored with its kind tag, so a
/// string and a byte string with equal contents read back as different
/// kinds.
pub struct TypedDb {
    db: HashDb,
}

impl TypedDb {
    /// Wrap an already configured (open or closed) handle.
    pub fn new(db: HashDb) -> Self {
        Self { db }
    }

    /// Open `path` with `tuning`, creating the file if needed.
    pub fn open<P: AsRef<Path>>(path: P, tuning: Tuning) -> TypedResult<Self> {
        let mut db = HashDb::new();
        db.tune(tuning)?;
        db.open(path, OpenMode::default())?;
        Ok(Self { db })
    }

    /// The underlying engine handle.
    pub fn engine(&self) -> &HashDb {
        &self.db
    }

    pub fn into_inner(self) -> HashDb {
        self.db
    }

    pub fn put<K: AsRef<[u8]>, V: Into<Value>>(&self, key: K, value: V) -> TypedResult<()> {
        Ok(self.db.put(key.as_ref(), &value.into().encode())?)
    }

    /// Store only if the key is new; `false` when it already exists.
    pub fn put_keep<K: AsRef<[u8]>, V: Into<Value>>(&self, key: K, value: V) -> TypedResult<bool> {
        Ok(self.db.put_keep(key.as_ref(), &value.into().encode())?)
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> TypedResult<Option<Value>> {
        match self.db.get(key.as_ref())? {
            Some(stored) => Value::decode(&stored).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_str<K: AsRef<[u8]>>(&self, key: K) -> TypedResult<Option<String>> {
        match self.get(key)? {
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(other) => Err(TypedError::KindMismatch { expected: "str", found: other.kind() }),
            None => Ok(None),
        }
    }

    pub fn get_int<K: AsRef<[u8]>>(&self, key: K) -> TypedResult<Option<i32>> {
        match self.get(key)? {
            Some(Value::Int(n)) => Ok(Some(n)),
            Some(other) => Err(TypedError::KindMismatch { expected: "int", found: other.kind() }),
            None => Ok(None),
        }
    }

    pub fn get_double<K: AsRef<[u8]>>(&self, key: K) -> TypedResult<Option<f64>> {
        match self.get(key)? {
            Some(Value::Double(x)) => Ok(Some(x)),
            Some(other) => Err(TypedError::KindMismatch { expected: "double", found: other.kind() }),
            None => Ok(None),
        }
    }

    /// Remove `key`; returns whether it existed.
    pub fn remove<K: AsRef<[u8]>>(&self, key: K) -> TypedResult<bool> {
        match self.db.out(key.as_ref()) {
            Ok(()) => Ok(true),
            Err(err) if err.code == ErrorCode::NoRec => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains<K: AsRef<[u8]>>(&self, key: K) -> TypedResult<bool> {
        Ok(self.db.contains(key.as_ref())?)
    }

    /// Add `delta` to an int value, creating it if absent. Overflow fails
    /// with [`ErrorCode::Misc`] and leaves the value unchanged.
    ///
    /// Runs in its own transaction, or inside the caller's when one is
    /// already open on the handle.
    pub fn add_int<K: AsRef<[u8]>>(&self, key: K, delta: i32) -> TypedResult<i32> {
        let key = key.as_ref();
        if self.db.tran_active() {
            return self.add_int_unlocked(key, delta);
        }
        self.db.tran_begin()?;
        match self.add_int_unlocked(key, delta) {
            Ok(sum) => {
                self.db.tran_commit()?;
                Ok(sum)
            }
            Err(err) => {
                self.db.tran_abort()?;
                Err(err)
            }
        }
    }

    fn add_int_unlocked(&self, key: &[u8], delta: i32) -> TypedResult<i32> {
        let sum = self
            .get_int(key)?
            .unwrap_or(0)
            .checked_add(delta)
            .ok_or_else(|| HdbError::new(ErrorCode::Misc, "integer addition overflowed"))?;
        self.put(key, sum)?;
        Ok(sum)
    }

    /// Every record, decoded.
    pub fn entries(&self) -> TypedResult<Vec<(Vec<u8>, Value)>> {
        let mut entries = Vec::new();
        let mut failure = None;
        self.db.for_each(|key, stored| match Value::decode(stored) {
            Ok(value) => {
                entries.push((key.to_vec(), value));
                true
            }
            Err(err) => {
                failure = Some(err);
                false
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(entries),
        }
    }

    pub fn len(&self) -> u64 {
        self.db.rnum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) -> TypedResult<()> {
        Ok(self.db.close()?)
    }
}

impl std::fmt::Debug for TypedDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedDb")
            .field("path", &self.db.path())
            .field("entries", &self.db.rnum())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TypedDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = TypedDb::open(dir.path().join("typed.hkh"), Tuning::small()).unwrap();
        (db, dir)
    }

    #[test]
    fn test_open_and_debug() {
        let (db, _dir) = test_db();
        db.put("k", 1).unwrap();
        let debug = format!("{:?}", db);
        assert!(debug.contains("TypedDb"));
        assert!(debug.contains("entries: 1"));
    }

    #[test]
    fn test_kind_mismatch() {
        let (db, _dir) = test_db();
        db.put("name", "ada").unwrap();
        let err = db.get_int("name").unwrap_err();
        assert!(matches!(err, TypedError::KindMismatch { expected: "int", found: "str" }));
    }

    #[test]
    fn test_add_int_rolls_back_on_overflow() {
        let (db, _dir) = test_db();
        assert_eq!(db.add_int("n", 5).unwrap(), 5);
        db.put("n", i32::MAX).unwrap();
        let err = db.add_int("n", 1).unwrap_err();
        assert!(matches!(err, TypedError::Engine(ref e) if e.code == ErrorCode::Misc));
        assert_eq!(db.get_int("n").unwrap(), Some(i32::MAX));
    }
}
