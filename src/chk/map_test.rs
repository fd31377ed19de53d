use rand::{prelude::random, rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};

use super::*;
use crate::chk::{Config, MemStore, SearchKey, Store};

fn key1(a: &str) -> Key {
    vec![a.as_bytes().to_vec()]
}

fn config(maximum_size: usize, search_key: SearchKey) -> Config {
    let mut config = Config::new(maximum_size, 1);
    config.set_search_key(search_key);
    config
}

// build a fresh map over the same store from `items` inserted in the
// given order, returning its saved root.
fn build_map(
    store: &mut dyn Store,
    cfg: &Config,
    items: &[(Key, Vec<u8>)],
) -> (CHKMap, String) {
    let mut map = CHKMap::new(cfg.clone());
    for (key, value) in items.iter() {
        map.map(store, key, value).unwrap();
    }
    let root = map.save(store).unwrap();
    (map, root)
}

#[test]
fn test_empty_map_save() {
    let mut store = MemStore::new();
    let mut map = CHKMap::new(config(10, SearchKey::Plain));
    assert!(map.is_empty());
    let root = map.save(&mut store).unwrap();
    assert_eq!(root, "sha1:f34c3f0634ea3f85953dffa887620c0a5b1f4a51");
    assert_eq!(map.to_key(), Some(root));
}

#[test]
fn test_map_get_unmap_small() {
    let mut store = MemStore::new();
    let mut map = CHKMap::new(config(4096, SearchKey::Plain));
    map.map(&mut store, &key1("a"), b"content a").unwrap();
    map.map(&mut store, &key1("b"), b"content b").unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&mut store, &key1("a")).unwrap(), Some(b"content a".to_vec()));
    assert_eq!(map.get(&mut store, &key1("x")).unwrap(), None);

    // update in place.
    map.map(&mut store, &key1("a"), b"content a2").unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&mut store, &key1("a")).unwrap(), Some(b"content a2".to_vec()));

    map.unmap(&mut store, &key1("a")).unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&mut store, &key1("a")).unwrap(), None);
    assert!(map.unmap(&mut store, &key1("a")).is_err());
}

#[test]
fn test_split_and_shape() {
    // three keys, a tiny leaf budget, the tree partitions under the
    // shortest distinguishing prefixes.
    let mut store = MemStore::new();
    let mut map = CHKMap::new(config(15, SearchKey::Plain));
    map.map(&mut store, &key1("aaa"), b"1").unwrap();
    map.map(&mut store, &key1("abb"), b"2").unwrap();
    map.map(&mut store, &key1("ccc"), b"3").unwrap();

    assert_eq!(
        map.to_dump_tree(&mut store).unwrap(),
        "'' InternalNode\n\
         \x20 'a' InternalNode\n\
         \x20   'aa' LeafNode\n\
         \x20     ('aaa',) '1'\n\
         \x20   'ab' LeafNode\n\
         \x20     ('abb',) '2'\n\
         \x20 'c' LeafNode\n\
         \x20     ('ccc',) '3'\n"
    );

    // both insertion orders produce the same root hash.
    let items: Vec<(Key, Vec<u8>)> = vec![
        (key1("aaa"), b"1".to_vec()),
        (key1("abb"), b"2".to_vec()),
        (key1("ccc"), b"3".to_vec()),
    ];
    let cfg = config(15, SearchKey::Plain);
    let (_, forward) = build_map(&mut store, &cfg, &items);
    let reversed: Vec<(Key, Vec<u8>)> = items.iter().rev().cloned().collect();
    let (_, backward) = build_map(&mut store, &cfg, &reversed);
    assert_eq!(forward, backward);
}

#[test]
fn test_search_key_16_layout() {
    let mut store = MemStore::new();
    let mut map = CHKMap::new(config(10, SearchKey::Hash16Way));
    map.map(&mut store, &key1("1"), b"foo").unwrap();
    map.map(&mut store, &key1("2"), b"bar").unwrap();
    map.map(&mut store, &key1("3"), b"baz").unwrap();

    let expected = "'' InternalNode\n\
                    \x20 '1' LeafNode\n\
                    \x20     ('2',) 'bar'\n\
                    \x20 '6' LeafNode\n\
                    \x20     ('3',) 'baz'\n\
                    \x20 '8' LeafNode\n\
                    \x20     ('1',) 'foo'\n";
    assert_eq!(map.to_dump_tree(&mut store).unwrap(), expected);

    // values come back correctly through a reload.
    let root = map.save(&mut store).unwrap();
    let mut map =
        CHKMap::from_root(&mut store, &root, config(10, SearchKey::Hash16Way)).unwrap();
    assert_eq!(map.get(&mut store, &key1("1")).unwrap(), Some(b"foo".to_vec()));
    assert_eq!(map.to_dump_tree(&mut store).unwrap(), expected);
}

#[test]
fn test_search_key_255_layout() {
    let mut store = MemStore::new();
    let mut map = CHKMap::new(config(10, SearchKey::Hash255Way));
    map.map(&mut store, &key1("1"), b"foo").unwrap();
    map.map(&mut store, &key1("2"), b"bar").unwrap();
    map.map(&mut store, &key1("3"), b"baz").unwrap();

    let expected = "'' InternalNode\n\
                    \x20 '\\x1a' LeafNode\n\
                    \x20     ('2',) 'bar'\n\
                    \x20 'm' LeafNode\n\
                    \x20     ('3',) 'baz'\n\
                    \x20 '\\x83' LeafNode\n\
                    \x20     ('1',) 'foo'\n";
    assert_eq!(map.to_dump_tree(&mut store).unwrap(), expected);
}

#[test]
fn test_oversized_item_sits_alone() {
    let mut store = MemStore::new();
    let mut map = CHKMap::new(config(40, SearchKey::Plain));
    let big = vec![b'x'; 100];
    map.map(&mut store, &key1("aaa"), &big).unwrap();
    map.map(&mut store, &key1("abb"), b"tiny").unwrap();

    let dump = map.to_dump_tree(&mut store).unwrap();
    // the big item lives alone in its own leaf.
    assert!(dump.starts_with("'' InternalNode\n"), "{}", dump);
    assert!(dump.contains("  'aa' LeafNode\n"), "{}", dump);
    assert!(dump.contains("  'ab' LeafNode\n"), "{}", dump);
    assert_eq!(map.get(&mut store, &key1("aaa")).unwrap(), Some(big));
}

#[test]
fn test_canonical_form_random() {
    let seed: u64 = random();
    println!("test_canonical_form_random seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    for search_key in [SearchKey::Plain, SearchKey::Hash16Way, SearchKey::Hash255Way].iter() {
        let mut store = MemStore::new();
        let mut items: Vec<(Key, Vec<u8>)> = vec![];
        for i in 0..100 {
            let key = key1(&format!("k{:x}", rng.gen::<u32>() % 4096));
            let value = format!("value {}", i).into_bytes();
            if !items.iter().any(|(k, _)| k == &key) {
                items.push((key, value));
            }
        }

        let cfg = config(64, *search_key);
        let (_, root) = build_map(&mut store, &cfg, &items);
        for _round in 0..4 {
            items.shuffle(&mut rng);
            let (mut map, shuffled_root) = build_map(&mut store, &cfg, &items);
            assert_eq!(shuffled_root, root, "seed:{} {:?}", seed, search_key);
            // and the contents survive.
            let got = map.iter_items(&mut store).unwrap();
            assert_eq!(got.len(), items.len());
        }
    }
}

#[test]
fn test_unmap_keeps_canonical_form() {
    let seed: u64 = random();
    println!("test_unmap_keeps_canonical_form seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut store = MemStore::new();
    let cfg = config(64, SearchKey::Plain);
    let mut items: Vec<(Key, Vec<u8>)> = (0..60)
        .map(|i| (key1(&format!("key-{:03}", i)), format!("v{}", i).into_bytes()))
        .collect();

    let (mut map, _) = build_map(&mut store, &cfg, &items);
    items.shuffle(&mut rng);
    while let Some((key, _)) = items.pop() {
        map.unmap(&mut store, &key).unwrap();
        let root = map.save(&mut store).unwrap();
        // rebuilding from the surviving items lands on the same hash.
        let (_, rebuilt) = build_map(&mut store, &cfg, &items);
        assert_eq!(root, rebuilt, "seed:{} left:{}", seed, items.len());
    }
    assert!(map.is_empty());
}

#[test]
fn test_from_root_restores_config() {
    let mut store = MemStore::new();
    let cfg = config(77, SearchKey::Plain);
    let items = vec![(key1("a"), b"1".to_vec())];
    let (_, root) = build_map(&mut store, &cfg, &items);

    let map = CHKMap::from_root(&mut store, &root, Config::new(0, 9)).unwrap();
    assert_eq!(map.as_config().maximum_size, 77);
    assert_eq!(map.as_config().key_width, 1);
}

#[test]
fn test_save_is_incremental() {
    let mut store = MemStore::new();
    let cfg = config(30, SearchKey::Plain);
    let items: Vec<(Key, Vec<u8>)> = (0..20)
        .map(|i| (key1(&format!("key-{:02}", i)), b"v".to_vec()))
        .collect();
    let (mut map, root) = build_map(&mut store, &cfg, &items);

    // save with no changes returns the same root and writes nothing.
    let n_nodes = store.len();
    assert_eq!(map.save(&mut store).unwrap(), root);
    assert_eq!(store.len(), n_nodes);

    // a single-key change dirties one spine only.
    map.map(&mut store, &key1("key-00"), b"changed").unwrap();
    let new_root = map.save(&mut store).unwrap();
    assert_ne!(new_root, root);
    let written = store.len() - n_nodes;
    assert!(written >= 2, "written {}", written);
    assert!(written < 6, "written {}", written);
}
