use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use cinderdb::{
    BackupEngine, BackupOptions, Engine, ErrorKind, Options, ReadOptions, Result, WriteBatch,
    WriteOptions,
};

fn contents(engine: &Engine) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    engine.scan(&ReadOptions::default(), ..)?.collect()
}

fn newest_wal(dir: &Path) -> PathBuf {
    let mut wals: Vec<PathBuf> = fs::read_dir(dir.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "wal"))
        .collect();
    wals.sort();
    wals.pop().expect("no WAL segment")
}

#[test]
fn test_put_batch_backup_verify() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(Options::new(dir.path().join("db")))?;
    let (w, r) = (WriteOptions::default(), ReadOptions::default());

    engine.put(&w, "key1", "value")?;
    assert_eq!(engine.get(&r, b"key1")?, Some(b"value".to_vec()));

    let mut batch = WriteBatch::new();
    batch.delete("key1").put("key2", "value");
    engine.write(&w, batch)?;
    assert_eq!(engine.get(&r, b"key1")?, None);
    assert_eq!(engine.get(&r, b"key2")?, Some(b"value".to_vec()));

    let backups = BackupEngine::open(BackupOptions::new(dir.path().join("backups")))?;
    let id = backups.create_new_backup(&engine)?;
    let info = backups.get_backup_info()?;
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].id, id);
    backups.verify_backup(id)?;

    engine.close()
}

#[test]
fn test_last_writer_wins() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(Options::new(dir.path()).write_buffer_size(8 * 1024))?;
    let (w, r) = (WriteOptions::default(), ReadOptions::default());
    let mut model = BTreeMap::new();

    for i in 0..600u32 {
        let key = format!("key{:03}", i % 97).into_bytes();
        if i % 7 == 0 {
            engine.delete(&w, key.clone())?;
            model.remove(&key);
        } else {
            let value = format!("value{i}").into_bytes();
            engine.put(&w, key.clone(), value.clone())?;
            model.insert(key.clone(), value);
        }
        assert_eq!(engine.get(&r, &key)?, model.get(&key).cloned());
    }
    Ok(())
}

#[test]
fn test_batch_is_atomic_for_concurrent_readers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Arc::new(Engine::open(Options::new(dir.path()).write_buffer_size(4 * 1024))?);
    let w = WriteOptions::default();
    engine.put(&w, "k1", "v")?;

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            let done = done.clone();
            thread::spawn(move || -> Result<usize> {
                let mut checks = 0;
                while !done.load(Ordering::SeqCst) {
                    let snapshot = engine.snapshot();
                    let r = ReadOptions::at(snapshot.sequence());
                    let k1 = engine.get(&r, b"k1")?.is_some();
                    let k2 = engine.get(&r, b"k2")?.is_some();
                    assert!(k1 ^ k2, "observed half a batch: k1={k1} k2={k2}");

                    let keys: Vec<Vec<u8>> = engine
                        .scan(&ReadOptions::default(), ..)?
                        .map(|kv| kv.map(|(k, _)| k))
                        .collect::<Result<_>>()?;
                    assert_eq!(keys.len(), 1, "scan observed half a batch: {keys:?}");
                    checks += 1;
                }
                Ok(checks)
            })
        })
        .collect();

    for i in 0..2000 {
        let mut batch = WriteBatch::new();
        if i % 2 == 0 {
            batch.delete("k1").put("k2", "v");
        } else {
            batch.delete("k2").put("k1", "v");
        }
        engine.write(&w, batch)?;
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().expect("reader panicked")?;
    }
    Ok(())
}

#[test]
fn test_wal_replay_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let w = WriteOptions::sync();

    let engine = Engine::open(Options::new(dir.path()))?;
    engine.put(&w, "a", "1")?;
    engine.put(&w, "b", "2")?;
    engine.delete(&w, "a")?;
    engine.put(&w, "c", "3")?;
    let expected = contents(&engine)?;
    engine.close()?;

    for _ in 0..3 {
        let engine = Engine::open(Options::new(dir.path()))?;
        assert_eq!(contents(&engine)?, expected);
        assert_eq!(engine.stats()?.last_sequence, 4);
        engine.close()?;
    }
    Ok(())
}

#[test]
fn test_torn_wal_tail_is_truncated() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let w = WriteOptions::sync();

    let engine = Engine::open(Options::new(dir.path()))?;
    engine.put(&w, "a", "1")?;
    engine.put(&w, "b", "2")?;
    engine.close()?;

    let wal = newest_wal(dir.path());
    let intact = fs::metadata(&wal)?.len();
    OpenOptions::new()
        .append(true)
        .open(&wal)?
        .write_all(&[0xde, 0xad, 0xbe])?;

    let engine = Engine::open(Options::new(dir.path()))?;
    let r = ReadOptions::default();
    assert_eq!(engine.get(&r, b"a")?, Some(b"1".to_vec()));
    assert_eq!(engine.get(&r, b"b")?, Some(b"2".to_vec()));
    assert_eq!(fs::metadata(&wal)?.len(), intact);

    engine.put(&w, "c", "3")?;
    engine.close()?;

    let engine = Engine::open(Options::new(dir.path()))?;
    assert_eq!(contents(&engine)?.len(), 3);
    assert_eq!(engine.get(&r, b"c")?, Some(b"3".to_vec()));
    engine.close()
}

#[test]
fn test_compaction_is_transparent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(Options::new(dir.path()).write_buffer_size(4 * 1024))?;
    let w = WriteOptions::default();

    for round in 0..4 {
        for i in 0..250u32 {
            let key = format!("key{i:04}");
            if (i + round) % 5 == 0 {
                engine.delete(&w, key)?;
            } else {
                engine.put(&w, key, format!("{round}-{i}"))?;
            }
        }
    }
    engine.flush()?;
    let before = contents(&engine)?;
    assert!(!before.is_empty());

    engine.compact_all()?;
    assert_eq!(contents(&engine)?, before);
    assert_eq!(engine.stats()?.levels[0].tables, 0);

    engine.close()?;
    let engine = Engine::open(Options::new(dir.path()))?;
    assert_eq!(contents(&engine)?, before);
    engine.close()
}

#[test]
fn test_restore_ignores_later_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(Options::new(dir.path().join("db")).write_buffer_size(4 * 1024))?;
    let backups = BackupEngine::open(BackupOptions::new(dir.path().join("backups")))?;
    let w = WriteOptions::default();

    for i in 0..300u32 {
        engine.put(&w, format!("key{i:03}"), format!("old{i}"))?;
    }
    let captured = contents(&engine)?;
    let id = backups.create_new_backup(&engine)?;

    for i in 0..300u32 {
        if i % 2 == 0 {
            engine.delete(&w, format!("key{i:03}"))?;
        } else {
            engine.put(&w, format!("key{i:03}"), "new")?;
        }
    }
    engine.put(&w, "zzz", "late")?;
    engine.compact_all()?;
    backups.create_new_backup(&engine)?;

    let target = dir.path().join("restored");
    backups.restore_db_from_backup(id, &target)?;
    let restored = Engine::open(Options::new(&target))?;
    let r = ReadOptions::default();
    for (key, value) in &captured {
        assert_eq!(restored.get(&r, key)?.as_ref(), Some(value));
    }
    assert_eq!(restored.get(&r, b"zzz")?, None);
    assert_eq!(contents(&restored)?, captured);
    restored.close()?;
    engine.close()
}

#[test]
fn test_verify_names_corrupted_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(Options::new(dir.path().join("db")))?;
    let backups = BackupEngine::open(BackupOptions::new(dir.path().join("backups")))?;
    for i in 0..50u32 {
        engine.put(&WriteOptions::default(), format!("key{i}"), "value")?;
    }
    let id = backups.create_new_backup(&engine)?;
    backups.verify_backup(id)?;

    let table = fs::read_dir(dir.path().join("backups").join("shared"))?
        .next()
        .expect("backup has a table")?
        .path();
    let mut bytes = fs::read(&table)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&table, bytes)?;

    let err = backups.verify_backup(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
    assert_eq!(err.file(), Some(table.as_path()));
    engine.close()
}
