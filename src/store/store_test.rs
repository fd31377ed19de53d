use std::{cell::RefCell, fs, rc::Rc};

use super::*;
use crate::{store::StoreConfig, Error};

fn key1(a: &str) -> Key {
    vec![a.as_bytes().to_vec()]
}

fn key2(a: &str, b: &str) -> Key {
    vec![a.as_bytes().to_vec(), b.as_bytes().to_vec()]
}

fn temp_repo(name: &str, config: StoreConfig) -> Rc<RefCell<PackStore>> {
    let dir = std::env::temp_dir().join("gcpack-store-test").join(name);
    fs::remove_dir_all(&dir).ok();
    let packs = PackStore::create(dir.as_os_str(), config).unwrap();
    Rc::new(RefCell::new(packs))
}

fn commit(packs: &Rc<RefCell<PackStore>>, stores: &mut [&mut GcStore]) -> Option<String> {
    for store in stores.iter_mut() {
        store.flush().unwrap();
    }
    let name = packs.borrow_mut().commit_write_group().unwrap();
    for store in stores.iter_mut() {
        store.refresh().unwrap();
    }
    name
}

#[test]
fn test_add_and_get_round_trip() {
    let packs = temp_repo("round-trip", StoreConfig::new());
    let mut texts = GcStore::open(&packs, Role::Text).unwrap();

    packs.borrow_mut().start_write_group().unwrap();
    let sha1 = texts
        .add_lines(&key2("f1", "r1"), &[], &[b"line A\n", b"line B\n"])
        .unwrap();
    assert_eq!(sha1, crate::util::sha1_hex(b"line A\nline B\n"));

    // readable while still in the compressor.
    assert_eq!(texts.get_bytes(&key2("f1", "r1")).unwrap(), b"line A\nline B\n".to_vec());

    // readable after staging into the upload file.
    texts.flush().unwrap();
    assert_eq!(texts.get_bytes(&key2("f1", "r1")).unwrap(), b"line A\nline B\n".to_vec());

    // and after the commit.
    let name = commit(&packs, &mut [&mut texts]);
    assert!(name.is_some());
    assert_eq!(texts.get_bytes(&key2("f1", "r1")).unwrap(), b"line A\nline B\n".to_vec());
    assert_eq!(texts.keys().unwrap(), vec![key2("f1", "r1")]);

    // missing keys raise.
    match texts.get_bytes(&key2("f1", "r9")) {
        Err(Error::KeyNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}

#[test]
fn test_add_requires_write_group() {
    let packs = temp_repo("no-group", StoreConfig::new());
    let mut texts = GcStore::open(&packs, Role::Text).unwrap();
    assert!(texts.add_lines(&key2("f1", "r1"), &[], &[b"x\n"]).is_err());
}

#[test]
fn test_second_text_stored_as_delta() {
    let packs = temp_repo("delta-storage", StoreConfig::new());
    let mut texts = GcStore::open(&packs, Role::Text).unwrap();

    let text1: &[u8] = b"line A\nline B shared across revisions\nline C\n";
    let text2: &[u8] = b"line A\nline B shared across revisions\nline D\n";
    packs.borrow_mut().start_write_group().unwrap();
    texts.add_lines(&key2("f1", "r1"), &[], &[text1]).unwrap();
    texts
        .add_lines(&key2("f1", "r2"), &[key2("f1", "r1")], &[text2])
        .unwrap();
    commit(&packs, &mut [&mut texts]);

    // native storage for the second record is a delta.
    let records: Vec<Record> = texts
        .get_record_stream(&[key2("f1", "r2")], Ordering::Topological, false)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    match &records[0] {
        Record::Delta { key, parents, delta, .. } => {
            assert_eq!(key, &key2("f1", "r2"));
            assert_eq!(parents, &vec![key2("f1", "r1")]);
            assert!(delta.len() < text2.len() / 2);
        }
        _ => panic!("expected a delta record"),
    }

    // the delta closure resolves it back to a fulltext.
    let records: Vec<Record> = texts
        .get_record_stream(&[key2("f1", "r2")], Ordering::Topological, true)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    match &records[0] {
        Record::Fulltext { bytes, sha1, .. } => {
            assert_eq!(bytes, &text2.to_vec());
            assert_eq!(sha1, &crate::util::sha1_hex(text2));
        }
        _ => panic!("expected a fulltext record"),
    }
}

#[test]
fn test_topological_stream_order() {
    // A: (), B: (A,), C: (A, B); requesting [C, A, B] yields A, B, C.
    let packs = temp_repo("topological", StoreConfig::new());
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();

    let (a, b, c) = (key1("A"), key1("B"), key1("C"));
    packs.borrow_mut().start_write_group().unwrap();
    revs.add_lines(&a, &[], &[b"text of A\n"]).unwrap();
    revs.add_lines(&b, &[a.clone()], &[b"text of B\n"]).unwrap();
    revs.add_lines(&c, &[a.clone(), b.clone()], &[b"text of C\n"]).unwrap();
    commit(&packs, &mut [&mut revs]);

    let keys = vec![c.clone(), a.clone(), b.clone()];
    let order: Vec<Key> = revs
        .get_record_stream(&keys, Ordering::Topological, true)
        .unwrap()
        .map(|r| r.unwrap().to_keys().remove(0))
        .collect();
    assert_eq!(order, vec![a.clone(), b.clone(), c.clone()]);

    // as-requested keeps the input order, absent keys in place.
    let keys = vec![c.clone(), key1("X"), a.clone()];
    let records: Vec<Record> = revs
        .get_record_stream(&keys, Ordering::AsRequested, true)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(records[0].to_keys(), vec![c]);
    match &records[1] {
        Record::Absent { key } => assert_eq!(key, &key1("X")),
        _ => panic!("expected absent record"),
    }
    assert_eq!(records[2].to_keys(), vec![a]);
}

#[test]
fn test_parent_map_and_missing_parents() {
    let packs = temp_repo("parents", StoreConfig::new());
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();

    packs.borrow_mut().start_write_group().unwrap();
    revs.add_lines(&key1("A"), &[], &[b"a\n"]).unwrap();
    // B references a ghost.
    revs.add_lines(&key1("B"), &[key1("A"), key1("ghost")], &[b"b\n"])
        .unwrap();

    let parent_map = revs.get_parent_map(&[key1("A"), key1("B"), key1("Z")]).unwrap();
    assert_eq!(parent_map.len(), 2);
    assert_eq!(parent_map[&key1("B")], vec![key1("A"), key1("ghost")]);

    assert_eq!(revs.get_missing_parents().unwrap(), vec![key1("ghost")]);
    commit(&packs, &mut [&mut revs]);

    // the ghost shows up in check() as a diagnostic, not an error.
    let report = revs.check().unwrap();
    assert_eq!(report.records, 2);
    assert_eq!(report.ghosts, vec![key1("ghost")]);
}

#[test]
fn test_inconsistent_adds() {
    let packs = temp_repo("inconsistent-fatal", StoreConfig::new());
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();

    packs.borrow_mut().start_write_group().unwrap();
    revs.add_lines(&key1("A"), &[], &[b"original\n"]).unwrap();
    // identical re-add is a no-op.
    let sha1 = revs.add_lines(&key1("A"), &[], &[b"original\n"]).unwrap();
    assert_eq!(sha1, crate::util::sha1_hex(b"original\n"));
    // different content raises.
    match revs.add_lines(&key1("A"), &[], &[b"changed\n"]) {
        Err(Error::InconsistentAdd(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    packs.borrow_mut().abort_write_group().unwrap();

    // non-fatal stores warn and keep the stored record.
    let mut config = StoreConfig::new();
    config.set_inconsistency_fatal(false);
    let packs = temp_repo("inconsistent-warn", config);
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();
    packs.borrow_mut().start_write_group().unwrap();
    let original = revs.add_lines(&key1("A"), &[], &[b"original\n"]).unwrap();
    let kept = revs.add_lines(&key1("A"), &[], &[b"changed\n"]).unwrap();
    assert_eq!(kept, original);
    assert_eq!(revs.get_bytes(&key1("A")).unwrap(), b"original\n".to_vec());
}

#[test]
fn test_abort_leaves_store_untouched() {
    let packs = temp_repo("abort-clean", StoreConfig::new());
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();

    packs.borrow_mut().start_write_group().unwrap();
    revs.add_lines(&key1("A"), &[], &[b"doomed\n"]).unwrap();
    revs.flush().unwrap();
    packs.borrow_mut().abort_write_group().unwrap();
    revs.refresh().unwrap();

    assert_eq!(revs.keys().unwrap(), Vec::<Key>::new());
    assert!(revs.get_bytes(&key1("A")).is_err());
}

#[test]
fn test_whole_block_reuse() {
    // a well-utilised block copies between stores byte identical.
    let packs = temp_repo("reuse-source", StoreConfig::new());
    let mut source = GcStore::open(&packs, Role::Text).unwrap();

    let texts: Vec<(Key, Vec<u8>)> = (0..4)
        .map(|i| {
            let text = format!("shared preamble of this file\nrevision body {}\n", i);
            (key2("f1", &format!("r{}", i)), text.into_bytes())
        })
        .collect();
    packs.borrow_mut().start_write_group().unwrap();
    for (key, text) in texts.iter() {
        source.add_lines(key, &[], &[text]).unwrap();
    }
    commit(&packs, &mut [&mut source]);

    let keys: Vec<Key> = texts.iter().map(|(k, _)| k.clone()).collect();
    let target_packs = temp_repo("reuse-target", StoreConfig::new());
    let mut target = GcStore::open(&target_packs, Role::Text).unwrap();
    target_packs.borrow_mut().start_write_group().unwrap();
    let stream = source
        .get_record_stream(&keys, Ordering::GroupCompress, false)
        .unwrap();
    target.insert_record_stream(stream).unwrap();
    commit(&target_packs, &mut [&mut target]);

    for (key, text) in texts.iter() {
        assert_eq!(&target.get_bytes(key).unwrap(), text);
    }

    // the block bytes in the target pack are identical to the source's.
    let source_block = {
        let position = source.index.get(&keys[0]).unwrap().unwrap();
        read_range(&position.pack, position.block_start, position.block_len).unwrap()
    };
    let target_block = {
        let position = target.index.get(&keys[0]).unwrap().unwrap();
        read_range(&position.pack, position.block_start, position.block_len).unwrap()
    };
    assert_eq!(source_block, target_block);
}

#[test]
fn test_insert_stream_rebuilds_sparse_blocks() {
    // only one small record of a large block is wanted; the receiver
    // re-compresses instead of splicing the block whole.
    let packs = temp_repo("rebuild-source", StoreConfig::new());
    let mut source = GcStore::open(&packs, Role::Text).unwrap();

    packs.borrow_mut().start_write_group().unwrap();
    let small = b"just a little text\n".to_vec();
    source.add_lines(&key2("f1", "small"), &[], &[&small]).unwrap();
    let mut big = vec![];
    for i in 0..2000 {
        big.extend_from_slice(format!("unrelated filler line {}\n", i).as_bytes());
    }
    source.add_lines(&key2("f1", "big"), &[], &[&big]).unwrap();
    commit(&packs, &mut [&mut source]);

    let target_packs = temp_repo("rebuild-target", StoreConfig::new());
    let mut target = GcStore::open(&target_packs, Role::Text).unwrap();
    target_packs.borrow_mut().start_write_group().unwrap();
    let stream = source
        .get_record_stream(&[key2("f1", "small")], Ordering::GroupCompress, false)
        .unwrap();
    target.insert_record_stream(stream).unwrap();
    commit(&target_packs, &mut [&mut target]);

    assert_eq!(target.get_bytes(&key2("f1", "small")).unwrap(), small);
    // the target block does not carry the big record.
    let position = target.index.get(&key2("f1", "small")).unwrap().unwrap();
    assert!(position.block_len < 1000, "block_len {}", position.block_len);
}

#[test]
fn test_insert_stream_rejects_bad_records() {
    let packs = temp_repo("insert-reject", StoreConfig::new());
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();
    packs.borrow_mut().start_write_group().unwrap();

    let absent = Record::Absent { key: key1("A") };
    assert!(revs.insert_record_stream(vec![Ok(absent)]).is_err());

    let bad_sha = Record::Fulltext {
        key: key1("A"),
        parents: vec![],
        sha1: "0".repeat(40),
        bytes: b"whatever\n".to_vec(),
    };
    match revs.insert_record_stream(vec![Ok(bad_sha)]) {
        Err(Error::InconsistentAdd(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }

    let bare_delta = Record::Delta {
        key: key1("A"),
        parents: vec![],
        sha1: "0".repeat(40),
        delta: vec![],
    };
    match revs.insert_record_stream(vec![Ok(bare_delta)]) {
        Err(Error::DeltaFail(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}

#[test]
fn test_multiple_groups_per_pack() {
    // a small group_size seals several blocks into one pack file.
    let mut config = StoreConfig::new();
    config.set_group_size(512);
    let packs = temp_repo("multi-group", config);
    let mut texts = GcStore::open(&packs, Role::Text).unwrap();

    let mut rng_texts = vec![];
    packs.borrow_mut().start_write_group().unwrap();
    for i in 0..40 {
        let text = format!("file body {} with distinct content {:x}\n", i, i * 7919);
        let key = key2("f1", &format!("r{:02}", i));
        texts.add_lines(&key, &[], &[text.as_bytes()]).unwrap();
        rng_texts.push((key, text.into_bytes()));
    }
    commit(&packs, &mut [&mut texts]);
    assert_eq!(packs.borrow().as_pack_names().len(), 1);

    // several distinct blocks back the records.
    let mut block_starts = std::collections::HashSet::new();
    for (key, text) in rng_texts.iter() {
        let position = texts.index.get(key).unwrap().unwrap();
        block_starts.insert(position.block_start);
        assert_eq!(&texts.get_bytes(key).unwrap(), text);
    }
    assert!(block_starts.len() > 1, "blocks {}", block_starts.len());

    let report = texts.check().unwrap();
    assert_eq!(report.records, 40);
    assert_eq!(report.ghosts, Vec::<Key>::new());
}

#[test]
fn test_pack_repository_rewrites() {
    let packs = temp_repo("repack", StoreConfig::new());
    let mut revs = GcStore::open(&packs, Role::Revision).unwrap();

    // two commits, two packs.
    packs.borrow_mut().start_write_group().unwrap();
    revs.add_lines(&key1("A"), &[], &[b"text of A\n"]).unwrap();
    commit(&packs, &mut [&mut revs]);
    packs.borrow_mut().start_write_group().unwrap();
    revs.add_lines(&key1("B"), &[key1("A")], &[b"text of B\n"]).unwrap();
    commit(&packs, &mut [&mut revs]);
    assert_eq!(packs.borrow().as_pack_names().len(), 2);

    let name = packs.borrow_mut().pack_repository().unwrap().unwrap();
    revs.refresh().unwrap();
    assert_eq!(packs.borrow().as_pack_names(), &[name]);

    assert_eq!(revs.get_bytes(&key1("A")).unwrap(), b"text of A\n".to_vec());
    assert_eq!(revs.get_bytes(&key1("B")).unwrap(), b"text of B\n".to_vec());
    let parent_map = revs.get_parent_map(&[key1("B")]).unwrap();
    assert_eq!(parent_map[&key1("B")], vec![key1("A")]);
    assert_eq!(revs.check().unwrap().records, 2);
}

#[test]
fn test_empty_text_records() {
    let packs = temp_repo("empty-text", StoreConfig::new());
    let mut texts = GcStore::open(&packs, Role::Text).unwrap();
    packs.borrow_mut().start_write_group().unwrap();
    let sha1 = texts.add_lines(&key2("f1", "r1"), &[], &[]).unwrap();
    assert_eq!(sha1, *crate::gcb::NULL_SHA1);
    commit(&packs, &mut [&mut texts]);
    assert_eq!(texts.get_bytes(&key2("f1", "r1")).unwrap(), Vec::<u8>::new());
    assert_eq!(texts.check().unwrap().records, 1);
}

#[test]
fn test_chk_store_round_trip() {
    use crate::chk::Store;

    let packs = temp_repo("chk-role", StoreConfig::new());
    let mut chks = GcStore::open(&packs, Role::Chk).unwrap();
    packs.borrow_mut().start_write_group().unwrap();

    let name = chks.put_chk(b"chkleaf:\n0\n1\n0\n\n").unwrap();
    assert_eq!(name, "sha1:8571e09bf1bcc5b9621ce31b3d4c93d6e9a1ed26");
    // idempotent.
    assert_eq!(chks.put_chk(b"chkleaf:\n0\n1\n0\n\n").unwrap(), name);
    assert_eq!(chks.get_chk(&name).unwrap(), b"chkleaf:\n0\n1\n0\n\n".to_vec());
    commit(&packs, &mut [&mut chks]);
    assert_eq!(chks.get_chk(&name).unwrap(), b"chkleaf:\n0\n1\n0\n\n".to_vec());
}

#[test]
fn test_topo_sort_random_dags() {
    use rand::{prelude::random, rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
    use std::collections::HashMap;

    let seed: u64 = random();
    println!("test_topo_sort_random_dags seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    for _round in 0..50 {
        // keys acquire parents only among earlier keys, guaranteeing a DAG.
        let n = (rng.gen::<usize>() % 40) + 1;
        let keys: Vec<Key> = (0..n).map(|i| key1(&format!("r{:03}", i))).collect();
        let mut parent_map: HashMap<Key, Vec<Key>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            let mut parents = vec![];
            for parent in keys[..i].iter() {
                if rng.gen::<u8>() % 4 == 0 {
                    parents.push(parent.clone());
                }
            }
            // the occasional ghost parent outside the requested set.
            if rng.gen::<u8>() % 8 == 0 {
                parents.push(key1("ghost"));
            }
            parent_map.insert(key.clone(), parents);
        }

        let mut shuffled = keys.clone();
        shuffled.shuffle(&mut rng);
        let order = topo_sort(&shuffled, &parent_map).unwrap();
        assert_eq!(order.len(), keys.len(), "seed:{}", seed);

        let position: HashMap<&Key, usize> =
            order.iter().enumerate().map(|(i, k)| (k, i)).collect();
        for key in keys.iter() {
            for parent in parent_map[key].iter() {
                if let Some(pp) = position.get(parent) {
                    assert!(pp < &position[key], "seed:{}", seed);
                }
            }
        }
    }
}

#[test]
fn test_topo_sort_detects_cycle() {
    let a = key1("A");
    let b = key1("B");
    let mut parent_map = std::collections::HashMap::new();
    parent_map.insert(a.clone(), vec![b.clone()]);
    parent_map.insert(b.clone(), vec![a.clone()]);
    assert!(topo_sort(&[a, b], &parent_map).is_err());
}
