use std::{sync::Arc, time::Instant};

use kkv_common::{KkvError, Locator};
use kkv_store::{
    config::{HashFunctionType, ValueCompression},
    segment::{IndexType, Segment, SegmentStatus, TabletData},
    KkvMemIndexer, KkvReader, LookupOptions, RawQuery, TimeoutTerminator,
};
use proptest::prelude::*;

mod common;
use common::*;

#[ctor::ctor]
fn init() {
    dev_utils::setup_test_log();
}

fn now() -> LookupOptions {
    LookupOptions::at(1000 * SEC)
}

#[test]
fn end_to_end_scenario() {
    let tablet = TabletBuilder::new(config())
        .built(|w| {
            w.add(1, 1, b"1", SEC, 0).unwrap();
            w.add(1, 12, b"12", 3 * SEC, 0).unwrap();
        })
        .building(|w| {
            w.add(1, 13, b"13", 4 * SEC, 0).unwrap();
        })
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();

    let all = values(reader.lookup(1, &[], &now()).unwrap());
    assert_eq!(sorted(all), vec![kv(1, "1"), kv(12, "12"), kv(13, "13")]);

    let some = values(reader.lookup(1, &[1, 13], &now()).unwrap());
    assert_eq!(sorted(some), vec![kv(1, "1"), kv(13, "13")]);

    assert!(values(reader.lookup(2, &[], &now()).unwrap()).is_empty());
}

#[test]
fn pkey_tombstone_hides_older_segments() {
    let tablet = TabletBuilder::new(config())
        .built(|w| w.add(1, 1, b"1", SEC, 0).unwrap())
        .building(|w| w.delete_pkey(1, 2 * SEC))
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    assert!(values(reader.lookup(1, &[], &now()).unwrap()).is_empty());
}

#[test]
fn newest_skey_wins() {
    let tablet = TabletBuilder::new(config())
        .built(|w| w.add(1, 5, b"A", SEC, 0).unwrap())
        .building(|w| w.add(1, 5, b"B", 2 * SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    assert_eq!(values(reader.lookup(1, &[], &now()).unwrap()), vec![kv(5, "B")]);
}

#[test]
fn skey_tombstone() {
    let tablet = TabletBuilder::new(config())
        .built(|w| {
            w.add(1, 5, b"A", SEC, 0).unwrap();
            w.add(1, 6, b"C", SEC, 0).unwrap();
        })
        .built(|w| w.delete_skey(1, 5, 2 * SEC))
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    assert_eq!(values(reader.lookup(1, &[], &now()).unwrap()), vec![kv(6, "C")]);
}

#[test]
fn ttl_boundary() {
    let mut config = config();
    config.ttl = Some(100);
    let tablet = TabletBuilder::new(config.clone())
        .built(|w| w.add(1, 1, b"1", 10 * SEC, 0).unwrap())
        .building(|w| w.add(1, 2, b"2", 10 * SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
    let at = |sec: u64| values(reader.lookup(1, &[], &LookupOptions::at(sec * SEC)).unwrap()).len();
    assert_eq!(at(110), 2);
    assert_eq!(at(111), 0);
}

#[test]
fn expire_time() {
    let mut config = config();
    config.store_expire_time = true;
    let tablet = TabletBuilder::new(config.clone())
        .built(|w| {
            w.add(1, 1, b"1", SEC, 50).unwrap();
            w.add(1, 2, b"2", SEC, 0).unwrap();
        })
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
    let at = |sec: u64| values(reader.lookup(1, &[], &LookupOptions::at(sec * SEC)).unwrap()).len();
    assert_eq!(at(49), 2);
    assert_eq!(at(50), 1);
}

#[test]
fn skey_count_limit() {
    let mut config = config();
    config.skey_count_limit = Some(2);
    let tablet = TabletBuilder::new(config.clone())
        .built(|w| {
            for skey in 0..5 {
                w.add(1, skey, b"v", SEC, 0).unwrap();
            }
        })
        .building(|w| w.add(1, 9, b"v", 2 * SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
    let got: Vec<_> = values(reader.lookup(1, &[], &now()).unwrap())
        .into_iter()
        .map(|(s, _)| s)
        .collect();
    assert_eq!(got, vec![9, 0]);
}

#[test]
fn compressed_values_come_back_plain() {
    let mut config = config();
    config.value_compression = ValueCompression::Lz4;
    let tablet = TabletBuilder::new(config.clone())
        .built(|w| w.add(1, 1, b"aaaaaaaaaaaaaaaaaaaaaaaa", SEC, 0).unwrap())
        .building(|w| w.add(1, 2, b"bbbbbbbbbbbbbbbbbbbbbbbb", SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
    assert_eq!(
        sorted(values(reader.lookup(1, &[], &now()).unwrap())),
        vec![kv(1, "aaaaaaaaaaaaaaaaaaaaaaaa"), kv(2, "bbbbbbbbbbbbbbbbbbbbbbbb")]
    );
}

#[test]
fn random_writes_match_model() {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut model: BTreeMap<u64, BTreeMap<u32, Bytes>> = BTreeMap::new();
    let mut builder = TabletBuilder::new(config());
    for segment in 0..4 {
        let mut ops = Vec::new();
        for _ in 0..200 {
            let pkey = rng.gen_range(0..8u64);
            let skey = rng.gen_range(0..16u32);
            let op = match rng.gen_range(0..20) {
                0 => None,
                1..=3 => Some(None),
                _ => {
                    let len = rng.gen_range(1..64);
                    Some(Some(Bytes::from((0..len).map(|_| rng.gen()).collect::<Vec<u8>>())))
                }
            };
            ops.push((pkey, skey, op));
        }
        for (pkey, skey, op) in &ops {
            let skeys = model.entry(*pkey).or_default();
            match op {
                None => skeys.clear(),
                Some(None) => {
                    skeys.remove(skey);
                }
                Some(Some(v)) => {
                    skeys.insert(*skey, v.clone());
                }
            }
        }
        let write = move |w: &KkvMemIndexer<u32>| {
            for (pkey, skey, op) in ops {
                match op {
                    None => w.delete_pkey(pkey, SEC),
                    Some(None) => w.delete_skey(pkey, skey, SEC),
                    Some(Some(v)) => w.add(pkey, skey, &v, SEC, 0).unwrap(),
                }
            }
        };
        builder = if segment == 3 {
            builder.building(write)
        } else {
            builder.built(write)
        };
    }

    let reader = KkvReader::<u32>::open(Arc::new(config()), &builder.tablet()).unwrap();
    for pkey in 0..8u64 {
        let expected: Vec<_> = model
            .get(&pkey)
            .map(|m| m.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default();
        let got = sorted(values(reader.lookup(pkey, &[], &now()).unwrap()));
        assert_eq!(got, expected, "pkey {}", pkey);
    }
}

#[test]
fn routes_by_shard() {
    let mut config = config();
    config.shard_count = 4;
    let tablet = TabletBuilder::new(config.clone())
        .built(|w| {
            for pkey in 0..16u64 {
                w.add(pkey, pkey as u32, b"v", SEC, 0).unwrap();
            }
        })
        .building(|w| w.add(7, 100, b"w", 2 * SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
    assert_eq!(reader.shard_count(), 4);
    for pkey in 0..16u64 {
        let skeys: Vec<_> = values(reader.lookup(pkey, &[], &now()).unwrap())
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        if pkey == 7 {
            assert_eq!(skeys, vec![100, 7]);
        } else {
            assert_eq!(skeys, vec![pkey as u32]);
        }
    }
}

#[test]
fn expired_timeout_returns_partial_result() {
    let tablet = TabletBuilder::new(config())
        .built(|w| w.add(1, 1, b"1", SEC, 0).unwrap())
        .building(|w| w.add(1, 2, b"2", SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    let options = now().with_timeout(TimeoutTerminator::with_deadline(Instant::now()));
    let iter = reader.lookup(1, &[], &options).unwrap();
    let metrics = iter.metrics().clone();
    assert!(values(iter).is_empty());
    let snapshot = metrics.snapshot();
    assert!(snapshot.timed_out);
    assert!(snapshot.finished);
}

#[test]
fn move_to_next_after_exhausted() {
    let tablet = TabletBuilder::new(config())
        .building(|w| w.add(1, 2, b"2", SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    let mut iter = reader.lookup(1, &[], &now()).unwrap();
    assert!(iter.is_valid());
    assert_eq!(iter.get_current_skey(), Some(2));
    assert_eq!(iter.get_current_timestamp(), Some(1));
    assert_eq!(iter.get_skey_field_name(), "skey");
    iter.move_to_next();
    assert!(!iter.is_valid());
    iter.move_to_next();
    iter.move_to_next();
    assert!(!iter.is_valid());
    assert_eq!(iter.get_current_skey(), None);
    assert!(matches!(iter.get_current_value(), Err(KkvError::NotFoundError(_))));
}

#[test]
fn small_batches() {
    let tablet = TabletBuilder::new(config())
        .built(|w| {
            for skey in 0..10 {
                w.add(1, skey, b"v", SEC, 0).unwrap();
            }
        })
        .building(|w| w.add(1, 10, b"v", SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    let iter = reader.lookup(1, &[], &now().with_batch_size(3)).unwrap();
    assert_eq!(values(iter).len(), 11);
}

#[test]
fn batch_lookup_isolates_bad_keys() {
    let mut config = config();
    config.hash_function = HashFunctionType::NumberHash;
    let tablet = TabletBuilder::new(config.clone())
        .built(|w| {
            w.add(1, 1, b"1", SEC, 0).unwrap();
            w.add(1, 2, b"2", SEC, 0).unwrap();
        })
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config), &tablet).unwrap();
    let queries = [
        RawQuery::new("1"),
        RawQuery::new("not a number"),
        RawQuery::new("1").with_skeys(["2"]),
        RawQuery::new("1").with_skeys(["2", "x"]),
    ];
    let got: Vec<_> = reader
        .batch_lookup(&queries, &now())
        .into_iter()
        .map(|r| values(r.unwrap()).len())
        .collect();
    assert_eq!(got, vec![2, 0, 1, 0]);
}

#[test]
fn open_rejects_schema_mismatch() {
    let mut other = config();
    other.schema_id = 3;
    let tablet = TabletBuilder::new(other).built(|_| {}).tablet();
    let err = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap_err();
    assert!(matches!(err, KkvError::InternalError(_)));
}

#[test]
fn open_rejects_shard_count_mismatch() {
    let mut two = config();
    two.shard_count = 2;
    let one = KkvMemIndexer::<u32>::new(&config()).unwrap();
    let two = KkvMemIndexer::<u32>::new(&two).unwrap();
    let tablet = TabletData::new(vec![
        Arc::new(
            Segment::new(0, SegmentStatus::Built, 0, Locator::new(0, 1))
                .with_indexer(IndexType::Kkv, "kkv", Arc::new(one.dump().unwrap())),
        ),
        Arc::new(Segment::new(1, SegmentStatus::Building, 0, Locator::invalid()).with_indexer(
            IndexType::Kkv,
            "kkv",
            Arc::new(two),
        )),
    ]);
    let err = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap_err();
    assert!(matches!(err, KkvError::InternalError(_)));
}

#[test]
fn open_rejects_bad_indexer() {
    let mem = KkvMemIndexer::<u32>::new(&config()).unwrap();
    let tablet = TabletData::new(vec![Arc::new(
        Segment::new(0, SegmentStatus::Built, 0, Locator::new(0, 1)).with_indexer(
            IndexType::Kkv,
            "kkv",
            Arc::new(mem),
        ),
    )]);
    let err = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap_err();
    assert!(matches!(err, KkvError::InternalError(_)));

    let tablet = TabletData::new(vec![Arc::new(Segment::new(
        0,
        SegmentStatus::Building,
        0,
        Locator::invalid(),
    ))]);
    let err = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap_err();
    assert!(matches!(err, KkvError::InternalError(_)));
}

#[test]
fn open_rejects_bad_config() {
    let mut config = config();
    config.shard_count = 3;
    let err = KkvReader::<u32>::open(Arc::new(config), &TabletData::default()).unwrap_err();
    assert!(matches!(err, KkvError::InvalidArgs(_)));
}

#[test]
fn shard_export_resumes_from_checkpoint() {
    let tablet = TabletBuilder::new(config())
        .built(|w| {
            w.add(1, 1, b"1", SEC, 0).unwrap();
            w.add(2, 1, b"1", SEC, 0).unwrap();
            w.add(3, 1, b"1", SEC, 0).unwrap();
        })
        .building(|w| {
            w.add(2, 2, b"2", 2 * SEC, 0).unwrap();
            w.delete_pkey(3, 2 * SEC);
        })
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    let all: Vec<_> = reader
        .shard_record_iterator(0, 1000 * SEC)
        .unwrap()
        .map(|r| r.map(|r| (r.pkey, r.skey)))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(all, vec![(1, 1), (2, 2), (2, 1)]);

    let mut iter = reader.shard_record_iterator(0, 1000 * SEC).unwrap();
    iter.next();
    iter.next();
    let checkpoint = iter.checkpoint();
    let mut resumed = reader.shard_record_iterator(0, 1000 * SEC).unwrap();
    resumed.seek(&checkpoint).unwrap();
    let rest: Vec<_> = resumed.map(|r| r.unwrap().skey).collect();
    assert_eq!(rest, vec![1]);
}

#[test]
fn async_lookup() {
    let tablet = TabletBuilder::new(config())
        .built(|w| w.add(1, 1, b"1", SEC, 0).unwrap())
        .building(|w| w.add(1, 2, b"2", SEC, 0).unwrap())
        .tablet();
    let reader = KkvReader::<u32>::open(Arc::new(config()), &tablet).unwrap();
    let iter = futures::executor::block_on(reader.lookup_async(1, &[2], &now())).unwrap();
    assert_eq!(values(iter), vec![kv(2, "2")]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn async_matches_sync(
        writes in proptest::collection::vec(
            proptest::collection::vec((0u64..4, 0u32..6, 0u8..4), 0..10),
            1..4,
        ),
        building in 0usize..2,
        filter in proptest::collection::vec(0u32..6, 0..3),
    ) {
        let mut builder = TabletBuilder::new(config());
        let split = writes.len().saturating_sub(building);
        for (seg, ops) in writes.iter().enumerate() {
            let apply = |w: &KkvMemIndexer<u32>| {
                for (i, (pkey, skey, op)) in ops.iter().enumerate() {
                    let ts = (seg as u64 * 10 + i as u64) * SEC;
                    match op {
                        0 => w.delete_pkey(*pkey, ts),
                        1 => w.delete_skey(*pkey, *skey, ts),
                        _ => w.add(*pkey, *skey, &skey.to_le_bytes(), ts, 0).unwrap(),
                    }
                }
            };
            builder = if seg < split { builder.built(apply) } else { builder.building(apply) };
        }
        let reader = KkvReader::<u32>::open(Arc::new(config()), &builder.tablet()).unwrap();
        for pkey in 0..4 {
            let sync = values(reader.lookup(pkey, &filter, &now()).unwrap());
            let not_sync = values(
                futures::executor::block_on(reader.lookup_async(pkey, &filter, &now())).unwrap(),
            );
            prop_assert_eq!(sync, not_sync);
        }
    }
}
