//! Property tests for the content-addressed artifact store.

use proptest::prelude::*;

use kiln::artifacts::{hash_bytes, ArtifactStore};
use kiln::ledger::{ArtifactKind, Ledger};
use tempfile::TempDir;

fn store_and_ledger() -> (TempDir, ArtifactStore, Ledger) {
    let temp = TempDir::new().unwrap();
    let store = ArtifactStore::open(temp.path().join("blobs")).unwrap();
    let ledger = Ledger::open_in_memory().unwrap();
    (temp, store, ledger)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn put_get_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let (_temp, store, ledger) = store_and_ledger();
        let record = store.put(&ledger, &bytes, ArtifactKind::Note, None).unwrap();
        prop_assert_eq!(store.get(&ledger, &record.id).unwrap(), bytes);
    }

    #[test]
    fn put_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let (_temp, store, ledger) = store_and_ledger();
        let first = store.put(&ledger, &bytes, ArtifactKind::Note, None).unwrap();
        let second = store.put(&ledger, &bytes, ArtifactKind::Note, None).unwrap();
        prop_assert_eq!(first.id, second.id);
        prop_assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn hash_equality_iff_bytes_equal(
        a in proptest::collection::vec(any::<u8>(), 0..512),
        b in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        prop_assert_eq!(hash_bytes(&a) == hash_bytes(&b), a == b);
    }

    #[test]
    fn size_matches_input(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let (_temp, store, ledger) = store_and_ledger();
        let record = store.put(&ledger, &bytes, ArtifactKind::BuildLog, None).unwrap();
        prop_assert_eq!(record.size as usize, bytes.len());
    }
}

#[test]
fn same_bytes_under_two_kinds_share_one_blob() {
    let (_temp, store, ledger) = store_and_ledger();
    let payload = vec![7u8; 4096];

    let a = store
        .put(&ledger, &payload, ArtifactKind::BuildPacket, None)
        .unwrap();
    let b = store.put(&ledger, &payload, ArtifactKind::Note, None).unwrap();

    assert_ne!(a.id, b.id, "two rows");
    assert_eq!(a.hash, b.hash, "one content address");
    assert_eq!(store.get(&ledger, &a.id).unwrap(), payload);
    assert_eq!(store.get(&ledger, &b.id).unwrap(), payload);
}
