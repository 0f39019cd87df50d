//! Integration tests: typed values stored through the engine.

use tempfile::TempDir;

use hashkeep_core::{HashDb, OpenMode, Options, Tuning};
use hashkeep_typed::{TypedDb, TypedError, Value};

fn test_db(dir: &TempDir) -> TypedDb {
    TypedDb::open(dir.path().join("typed.hkh"), Tuning::small()).unwrap()
}

#[test]
fn test_each_kind_roundtrips() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);

    db.put("str", "héllo").unwrap();
    db.put("int", -42).unwrap();
    db.put("double", 2.5f64).unwrap();
    db.put("bytes", vec![0u8, 255, 7]).unwrap();
    db.put("empty", "").unwrap();

    assert_eq!(db.get("str").unwrap(), Some(Value::Str("héllo".into())));
    assert_eq!(db.get("int").unwrap(), Some(Value::Int(-42)));
    assert_eq!(db.get("double").unwrap(), Some(Value::Double(2.5)));
    assert_eq!(db.get("bytes").unwrap(), Some(Value::Bytes(vec![0, 255, 7])));
    assert_eq!(db.get_str("empty").unwrap(), Some(String::new()));
    assert_eq!(db.get("missing").unwrap(), None);
    assert_eq!(db.len(), 5);
}

#[test]
fn test_values_survive_reopen_with_compression() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("typed.hkh");

    let db = TypedDb::open(&path, Tuning { opts: Options::DEFLATE, ..Tuning::small() }).unwrap();
    for i in 0..100 {
        db.put(format!("n{}", i), i).unwrap();
        db.put(format!("s{}", i), "repeated text ".repeat(i as usize)).unwrap();
    }
    db.close().unwrap();

    let engine = HashDb::new();
    engine.open(&path, OpenMode::default()).unwrap();
    let db = TypedDb::new(engine);
    assert_eq!(db.get_int("n77").unwrap(), Some(77));
    assert_eq!(db.get_str("s3").unwrap(), Some("repeated text ".repeat(3)));
    assert_eq!(db.entries().unwrap().len(), 200);
}

#[test]
fn test_put_keep_and_remove() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);

    assert!(db.put_keep("k", 1).unwrap());
    assert!(!db.put_keep("k", 2).unwrap());
    assert_eq!(db.get_int("k").unwrap(), Some(1));

    assert!(db.remove("k").unwrap());
    assert!(!db.remove("k").unwrap());
    assert!(!db.contains("k").unwrap());
    assert!(db.is_empty());
}

#[test]
fn test_add_int_accumulates() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);

    assert_eq!(db.add_int("hits", 10).unwrap(), 10);
    assert_eq!(db.add_int("hits", 2).unwrap(), 12);
    assert_eq!(db.get("hits").unwrap(), Some(Value::Int(12)));

    db.put("label", "x").unwrap();
    assert!(matches!(db.add_int("label", 1), Err(TypedError::KindMismatch { .. })));
    assert_eq!(db.get_str("label").unwrap(), Some("x".into()));
}

#[test]
fn test_add_int_joins_caller_transaction() {
    let dir = TempDir::new().unwrap();
    let mut engine = HashDb::new();
    engine.tune(Tuning::small()).unwrap();
    engine.set_mutex().unwrap();
    engine.open(dir.path().join("typed.hkh"), OpenMode::default()).unwrap();
    let db = TypedDb::new(engine);

    db.engine().tran_begin().unwrap();
    assert_eq!(db.add_int("n", 1).unwrap(), 1);
    assert_eq!(db.add_int("n", 1).unwrap(), 2);
    assert!(db.engine().tran_active());
    db.engine().tran_abort().unwrap();
    assert_eq!(db.get("n").unwrap(), None);

    db.engine().tran_begin().unwrap();
    db.put("label", "x").unwrap();
    assert!(matches!(db.add_int("label", 1), Err(TypedError::KindMismatch { .. })));
    assert_eq!(db.add_int("n", 7).unwrap(), 7);
    db.engine().tran_commit().unwrap();

    assert!(!db.engine().tran_active());
    assert_eq!(db.get_int("n").unwrap(), Some(7));
    assert_eq!(db.get_str("label").unwrap(), Some("x".into()));
}

#[test]
fn test_untagged_engine_value_is_reported() {
    let dir = TempDir::new().unwrap();
    let db = test_db(&dir);

    db.engine().put(b"raw", b"zzz").unwrap();
    assert!(matches!(db.get("raw"), Err(TypedError::UnknownTag { tag: b'z' })));
    assert!(db.entries().is_err());
}
