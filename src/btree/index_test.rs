use rand::{prelude::random, rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};

use std::fs;

use super::*;
use crate::btree::{new_page_cache, Builder};

fn key1(a: &str) -> Key {
    vec![a.as_bytes().to_vec()]
}

fn key2(a: &str, b: &str) -> Key {
    vec![a.as_bytes().to_vec(), b.as_bytes().to_vec()]
}

fn temp_index(name: &str, builder: &Builder) -> std::ffi::OsString {
    let dir = std::env::temp_dir().join("gcpack-btree-index-test");
    fs::create_dir_all(&dir).unwrap();
    let loc = dir.join(name).into_os_string();
    builder.write_to(&loc).unwrap();
    loc
}

#[test]
fn test_three_entries() {
    let mut builder = Builder::new(Config::new(1, 0));
    builder.add_entry(&key1("a"), b"1", &[]).unwrap();
    builder.add_entry(&key1("b"), b"2", &[]).unwrap();
    builder.add_entry(&key1("c"), b"3", &[]).unwrap();
    let loc = temp_index("three.tix", &builder);

    let mut index = Index::open(&loc, new_page_cache(btree::PAGE_CACHE_BYTES)).unwrap();
    assert_eq!(index.key_count(), 3);
    assert_eq!(index.key_elements(), 1);
    assert_eq!(index.node_ref_lists(), 0);

    // a full-width prefix is an exact lookup.
    let entries = index.iter_entries_prefix(&[key1("b")]).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, key1("b"));
    assert_eq!(entries[0].value, b"2".to_vec());

    assert_eq!(index.get(&key1("d")).unwrap(), None);
    let all: Vec<IndexEntry> =
        index.iter_all_entries().map(|e| e.unwrap()).collect();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].key, key1("a"));
    assert_eq!(all[2].value, b"3".to_vec());
}

#[test]
fn test_empty_index() {
    let builder = Builder::new(Config::new(1, 1));
    let loc = temp_index("empty.tix", &builder);
    let mut index = Index::open(&loc, new_page_cache(btree::PAGE_CACHE_BYTES)).unwrap();
    assert_eq!(index.key_count(), 0);
    assert_eq!(index.get(&key1("a")).unwrap(), None);
    assert_eq!(index.iter_all_entries().count(), 0);
    assert_eq!(index.iter_entries_prefix(&[key1("a")]).unwrap(), vec![]);
}

#[test]
fn test_unknown_format() {
    let dir = std::env::temp_dir().join("gcpack-btree-index-test");
    fs::create_dir_all(&dir).unwrap();
    let loc = dir.join("unknown.tix").into_os_string();
    fs::write(&loc, vec![b'x'; 256]).unwrap();
    match Index::open(&loc, new_page_cache(btree::PAGE_CACHE_BYTES)) {
        Err(crate::Error::UpgradeRequired(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}

#[test]
fn test_multi_level_index() {
    let seed: u64 = random();
    println!("test_multi_level_index seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut builder = Builder::new(Config::new(1, 1));
    let mut keys: Vec<Key> = vec![];
    for i in 0..4000_usize {
        let key = key1(&format!("k{:010x}", rng.gen::<u64>() >> 16));
        let value = format!("offsets {} {}", i, i * 7);
        let refs = match i {
            0 => vec![vec![]],
            _ => vec![vec![keys[rng.gen::<usize>() % keys.len()].clone()]],
        };
        if builder.add_entry(&key, value.as_bytes(), &refs).is_ok() {
            keys.push(key);
        }
    }
    let loc = temp_index("multi.tix", &builder);

    let mut index = Index::open(&loc, new_page_cache(btree::PAGE_CACHE_BYTES)).unwrap();
    assert_eq!(index.key_count(), keys.len());
    // deep enough to exercise internal pages.
    assert!(index.row_offsets.len() >= 3, "rows {:?}", index.row_offsets);

    // every key resolves to its entry.
    keys.shuffle(&mut rng);
    for key in keys.iter().take(500) {
        let entry = index.get(key).unwrap().unwrap();
        assert_eq!(&entry.key, key, "seed:{}", seed);
        assert_eq!(entry.refs.len(), 1);
    }

    // iter_all yields everything in sorted order.
    let mut sorted = keys.clone();
    sorted.sort();
    let all: Vec<Key> = index.iter_all_entries().map(|e| e.unwrap().key).collect();
    assert_eq!(all, sorted, "seed:{}", seed);

    // iter_entries matches the point lookups.
    let some: Vec<Key> = keys[..100].to_vec();
    let entries = index.iter_entries(&some).unwrap();
    assert_eq!(entries.len(), 100);
}

#[test]
fn test_prefix_scan_two_element_keys() {
    let mut builder = Builder::new(Config::new(2, 0));
    for fid in ["file-a", "file-b", "file-c"].iter() {
        for rev in 0..200 {
            let key = key2(fid, &format!("rev-{:04}", rev));
            builder
                .add_entry(&key, format!("{}", rev).as_bytes(), &[])
                .unwrap();
        }
    }
    let loc = temp_index("prefix.tix", &builder);
    let mut index = Index::open(&loc, new_page_cache(btree::PAGE_CACHE_BYTES)).unwrap();

    let entries = index.iter_entries_prefix(&[key1("file-b")]).unwrap();
    assert_eq!(entries.len(), 200);
    assert!(entries.iter().all(|e| e.key[0] == b"file-b".to_vec()));

    // missing prefix yields nothing.
    let entries = index.iter_entries_prefix(&[key1("file-z")]).unwrap();
    assert_eq!(entries, vec![]);

    // two prefixes at once.
    let entries = index
        .iter_entries_prefix(&[key1("file-a"), key1("file-c")])
        .unwrap();
    assert_eq!(entries.len(), 400);
}

#[test]
fn test_page_cache_reuse() {
    let mut builder = Builder::new(Config::new(1, 0));
    for i in 0..100 {
        builder
            .add_entry(&key1(&format!("k{:04}", i)), b"v", &[])
            .unwrap();
    }
    let loc = temp_index("cached.tix", &builder);

    let cache = new_page_cache(btree::PAGE_CACHE_BYTES);
    let mut index = Index::open(&loc, Rc::clone(&cache)).unwrap();
    index.get(&key1("k0000")).unwrap().unwrap();
    let warm = cache.borrow().len();
    assert!(warm >= 1);
    index.get(&key1("k0099")).unwrap().unwrap();
    // single page index, the second lookup hits the cache.
    assert_eq!(cache.borrow().len(), warm);
}
