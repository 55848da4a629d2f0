#![cfg(feature = "fjall")]

use keypoold_storage::fjall::FjallStore;
use keypoold_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_batch_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open(dir.path()).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::KeyPool, [0u8, 0, 0, 0, 1], b"entry-1".as_slice());
        batch.put(Column::KeyPool, [0u8, 0, 0, 0, 2], b"entry-2".as_slice());
        batch.put(Column::KeyPool, [1u8, 0, 0, 0, 1], b"change-1".as_slice());
        batch.put(Column::Meta, b"hdchain", b"chain".as_slice());
        store.write_batch(&batch).expect("commit");

        let mut batch = WriteBatch::new();
        batch.delete(Column::KeyPool, [0u8, 0, 0, 0, 1]);
        batch.put(Column::KeyMeta, [7u8; 20], b"used".as_slice());
        store.write_batch(&batch).expect("commit");
    }

    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    let external = store.scan_prefix(Column::KeyPool, &[0]).expect("scan");
    assert_eq!(external, vec![(vec![0, 0, 0, 0, 2], b"entry-2".to_vec())]);
    assert_eq!(
        store.get(Column::KeyMeta, &[7u8; 20]).expect("get"),
        Some(b"used".to_vec())
    );
    assert_eq!(
        store.get(Column::Meta, b"hdchain").expect("get"),
        Some(b"chain".to_vec())
    );
}
