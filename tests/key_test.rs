use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;

use mimir::{CacheKey, derive_key};

#[derive(Serialize)]
struct KlineRequest {
    market: &'static str,
    symbol: &'static str,
    start_date: &'static str,
    end_date: Option<&'static str>,
    count: Option<u32>,
}

/// Same fields, declared in a different order.
#[derive(Serialize)]
struct KlineRequestReordered {
    count: Option<u32>,
    end_date: Option<&'static str>,
    start_date: &'static str,
    symbol: &'static str,
    market: &'static str,
}

fn kline() -> KlineRequest {
    KlineRequest {
        market: "SH",
        symbol: "600000",
        start_date: "20240101",
        end_date: None,
        count: Some(20),
    }
}

#[test]
fn field_order_does_not_matter() {
    let reordered = KlineRequestReordered {
        count: Some(20),
        end_date: None,
        start_date: "20240101",
        symbol: "600000",
        market: "SH",
    };
    assert_eq!(
        derive_key("kline", &kline()).unwrap(),
        derive_key("kline", &reordered).unwrap()
    );
}

#[test]
fn map_insertion_order_does_not_matter() {
    let mut forward = HashMap::new();
    let mut backward = BTreeMap::new();
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        forward.insert(*name, i);
    }
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate().rev() {
        backward.insert(*name, i);
    }
    assert_eq!(
        derive_key("op", &forward).unwrap(),
        derive_key("op", &backward).unwrap()
    );
}

#[test]
fn every_field_contributes() {
    let base = derive_key("kline", &kline()).unwrap();

    let mut other = kline();
    other.symbol = "600519";
    assert_ne!(base, derive_key("kline", &other).unwrap());

    let mut other = kline();
    other.end_date = Some("20240131");
    assert_ne!(base, derive_key("kline", &other).unwrap());

    let mut other = kline();
    other.count = None;
    assert_ne!(base, derive_key("kline", &other).unwrap());
}

#[test]
fn sequence_order_matters() {
    assert_ne!(
        derive_key("op", &vec![1, 2]).unwrap(),
        derive_key("op", &vec![2, 1]).unwrap()
    );
}

#[test]
fn nested_members_are_sorted() {
    #[derive(Serialize)]
    struct Outer {
        z: Inner,
        a: u8,
    }
    #[derive(Serialize)]
    struct Inner {
        y: u8,
        b: u8,
    }

    let key = derive_key(
        "op",
        &Outer {
            z: Inner { y: 1, b: 2 },
            a: 3,
        },
    )
    .unwrap();
    assert_eq!(key.to_string(), r#"op/{"a":3,"z":{"b":2,"y":1}}"#);
}

#[test]
fn non_string_map_keys_fail() {
    let mut ranges = HashMap::new();
    ranges.insert((1u32, 2u32), "x");

    let err = derive_key("ranges", &ranges).unwrap_err();
    assert_eq!(err.operation, "ranges");
    assert!(err.to_string().contains("ranges"));
}

#[test]
fn non_finite_floats_get_distinct_keys() {
    let keys = [
        derive_key("op", &Some(f64::INFINITY)).unwrap(),
        derive_key("op", &Some(f64::NEG_INFINITY)).unwrap(),
        derive_key("op", &Some(f64::NAN)).unwrap(),
        derive_key("op", &None::<f64>).unwrap(),
        derive_key("op", &Some(0.0f64)).unwrap(),
        derive_key("op", &Some(f64::MAX)).unwrap(),
    ];
    let distinct: HashSet<&CacheKey> = keys.iter().collect();
    assert_eq!(distinct.len(), keys.len());

    // Stable across calls.
    assert_eq!(keys[2], derive_key("op", &Some(f64::NAN)).unwrap());
}

#[test]
fn ordered_sets_are_stable() {
    #[derive(Serialize)]
    struct Watchlist {
        symbols: BTreeSet<String>,
    }

    let forward = Watchlist {
        symbols: (0..16).map(|i| format!("s{i}")).collect(),
    };
    let backward = Watchlist {
        symbols: (0..16).rev().map(|i| format!("s{i}")).collect(),
    };
    let expected = derive_key("watch", &forward).unwrap();
    for _ in 0..50 {
        assert_eq!(derive_key("watch", &backward).unwrap(), expected);
    }
}

#[test]
fn canonical_keys_round_trip_namespace() {
    let key = CacheKey::from_canonical("kline", "SH:600000");
    assert_eq!(key.namespace(), "kline");
    assert_eq!(key.to_string(), "kline/SH:600000");
    assert_ne!(key, CacheKey::from_canonical("dates", "SH:600000"));
}
