use std::fs;

use super::*;
use crate::btree::{self, new_page_cache, Builder, Config, Index};

fn key1(a: &str) -> Key {
    vec![a.as_bytes().to_vec()]
}

fn build_index(name: &str, entries: &[(&str, &str)]) -> Index {
    let dir = std::env::temp_dir().join("gcpack-btree-combined-test");
    fs::create_dir_all(&dir).unwrap();
    let loc = dir.join(name).into_os_string();

    let mut builder = Builder::new(Config::new(1, 0));
    for (key, value) in entries.iter() {
        builder.add_entry(&key1(key), value.as_bytes(), &[]).unwrap();
    }
    builder.write_to(&loc).unwrap();
    Index::open(&loc, new_page_cache(btree::PAGE_CACHE_BYTES)).unwrap()
}

#[test]
fn test_first_index_wins() {
    let newer = build_index("newer.tix", &[("a", "new-a"), ("b", "new-b")]);
    let older = build_index("older.tix", &[("a", "old-a"), ("c", "old-c")]);
    let mut combined = Combined::new(vec![newer, older]);

    assert_eq!(combined.len_indexes(), 2);
    // shadowed key resolves to the first index.
    let (off, entry) = combined.get(&key1("a")).unwrap().unwrap();
    assert_eq!(off, 0);
    assert_eq!(entry.value, b"new-a".to_vec());
    let (off, entry) = combined.get(&key1("c")).unwrap().unwrap();
    assert_eq!(off, 1);
    assert_eq!(entry.value, b"old-c".to_vec());
    assert_eq!(combined.get(&key1("z")).unwrap(), None);

    // duplicate counted per index, an estimate.
    assert_eq!(combined.key_count(), 4);

    let all = combined.iter_all_entries().unwrap();
    assert_eq!(all.len(), 3);
    let a = all.iter().find(|(_, e)| e.key == key1("a")).unwrap();
    assert_eq!(a.1.value, b"new-a".to_vec());
}

#[test]
fn test_iter_entries_dedups_input() {
    let one = build_index("one.tix", &[("a", "1"), ("b", "2")]);
    let mut combined = Combined::new(vec![one]);
    let keys = vec![key1("a"), key1("a"), key1("b"), key1("x")];
    let entries = combined.iter_entries(&keys).unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn test_push_front_shadows() {
    let older = build_index("shadow-old.tix", &[("a", "old-a")]);
    let mut combined = Combined::new(vec![older]);
    let (_, entry) = combined.get(&key1("a")).unwrap().unwrap();
    assert_eq!(entry.value, b"old-a".to_vec());

    let newer = build_index("shadow-new.tix", &[("a", "new-a")]);
    combined.push_front(newer);
    let (off, entry) = combined.get(&key1("a")).unwrap().unwrap();
    assert_eq!(off, 0);
    assert_eq!(entry.value, b"new-a".to_vec());
}
