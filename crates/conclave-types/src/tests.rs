use test_case::test_case;

use super::*;

fn names(names: &[&str]) -> Vec<NodeName> {
    names.iter().map(|n| NodeName::from(*n)).collect()
}

#[test]
fn rank_follows_lexicographic_order() {
    let registry = names(&["Delta", "Alpha", "Charlie", "Beta"]);

    assert_eq!(NodeName::from("Alpha").rank(&registry), Some(0));
    assert_eq!(NodeName::from("Beta").rank(&registry), Some(1));
    assert_eq!(NodeName::from("Charlie").rank(&registry), Some(2));
    assert_eq!(NodeName::from("Delta").rank(&registry), Some(3));
    assert_eq!(NodeName::from("Echo").rank(&registry), None);
}

#[test]
fn ranked_sorts_registry() {
    let registry = names(&["Delta", "Alpha", "Charlie", "Beta"]);
    let sorted = ranked(&registry);
    assert_eq!(sorted, names(&["Alpha", "Beta", "Charlie", "Delta"]));
}

#[test_case(4, 1, 3, 2; "four nodes")]
#[test_case(7, 2, 5, 3; "seven nodes")]
#[test_case(10, 3, 7, 4; "ten nodes")]
#[test_case(13, 4, 9, 5; "thirteen nodes")]
fn cluster_arithmetic(n: usize, f: usize, q: usize, wq: usize) {
    assert_eq!(max_failures(n), f);
    assert_eq!(quorum(n), q);
    assert_eq!(weak_quorum(n), wq);
    assert_eq!(num_instances(n), f + 1);
}

#[test]
fn hash_hex_round_trip() {
    let mut bytes = [0u8; HASH_LENGTH];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = i as u8;
    }
    let hash = Hash::from_bytes(bytes);
    let hex = hash.to_hex();
    assert_eq!(hex.len(), 64);
    assert_eq!(Hash::from_hex(&hex), Some(hash));
}

#[test]
fn hash_rejects_bad_hex() {
    assert_eq!(Hash::from_hex("zz"), None);
    assert_eq!(Hash::from_hex(&"ab".repeat(31)), None);
    assert_eq!(Hash::from_hex(&"zz".repeat(32)), None);
}

#[test]
fn hash_serializes_as_hex_string() {
    let hash = Hash::from_bytes([0xab; HASH_LENGTH]);
    let json = serde_json::to_string(&hash).unwrap();
    assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));

    let back: Hash = serde_json::from_str(&json).unwrap();
    assert_eq!(back, hash);
}

#[test]
fn txn_id_serializes_as_hex_string() {
    let id = TxnId::from_bytes([0x01; HASH_LENGTH]);
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    let back: TxnId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn view_no_advances_by_one() {
    assert_eq!(ViewNo::ZERO.next(), ViewNo::new(1));
    assert_eq!(ViewNo::new(7).next(), ViewNo::new(8));
}

#[test]
fn timestamp_monotonic_never_repeats() {
    let first = Timestamp::now_monotonic(None);
    let second = Timestamp::now_monotonic(Some(first));
    assert!(second > first);

    // Even against a clock far in the future
    let future = Timestamp::from_nanos(u64::MAX - 1);
    let next = Timestamp::now_monotonic(Some(future));
    assert!(next > future);
}

#[test]
fn master_instance_is_zero() {
    assert!(InstId::MASTER.is_master());
    assert!(!InstId::new(1).is_master());
}
