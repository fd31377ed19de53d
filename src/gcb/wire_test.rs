use super::*;

fn key(label: &str) -> Key {
    vec![label.as_bytes().to_vec()]
}

fn key2(a: &str, b: &str) -> Key {
    vec![a.as_bytes().to_vec(), b.as_bytes().to_vec()]
}

fn make_group(texts: &[(Key, Vec<Key>, Vec<u8>)]) -> LazyGroup {
    let mut compressor = Compressor::new(&Config::default());
    let mut entries = vec![];
    for (k, parents, text) in texts.iter() {
        let (_, start, end, _) = compressor.compress(k, text, None).unwrap();
        entries.push(Entry {
            key: k.clone(),
            parents: parents.clone(),
            start,
            end,
        });
    }
    LazyGroup::new(compressor.flush().unwrap(), entries)
}

fn sample_texts() -> Vec<(Key, Vec<Key>, Vec<u8>)> {
    vec![
        (
            key2("file-id", "rev-1"),
            vec![],
            b"line A\nline B\nline C\n".to_vec(),
        ),
        (
            key2("file-id", "rev-2"),
            vec![key2("file-id", "rev-1")],
            b"line A\nline X\nline C\n".to_vec(),
        ),
        (
            key2("file-id", "rev-3"),
            vec![key2("file-id", "rev-1"), key2("file-id", "rev-2")],
            b"line A\nline X\nline C\nline D\n".to_vec(),
        ),
        (key("standalone"), vec![], b"quite unrelated content\n".to_vec()),
    ]
}

#[test]
fn test_wire_round_trip() {
    let texts = sample_texts();
    let mut group = make_group(&texts);
    let block_bytes = group.as_block().to_bytes();

    let wire = group.to_wire_bytes().unwrap();
    assert_eq!(&wire[..20], gcb::WIRE_HEADER);

    let mut decoded = LazyGroup::from_wire_bytes(&wire).unwrap();
    assert_eq!(decoded.as_entries(), group.as_entries());
    // the block bytes survive the trip bit-identical.
    assert_eq!(decoded.as_block().to_bytes(), block_bytes);
    for (k, _, text) in texts.iter() {
        assert_eq!(&decoded.extract(k).unwrap(), text);
    }
}

#[test]
fn test_wire_bad_bytes() {
    assert!(LazyGroup::from_wire_bytes(b"").is_err());
    assert!(LazyGroup::from_wire_bytes(b"groupcompress-block\n").is_err());
    let mut group = make_group(&sample_texts());
    let mut wire = group.to_wire_bytes().unwrap();
    wire.truncate(wire.len() - 1);
    assert!(LazyGroup::from_wire_bytes(&wire).is_err());
}

#[test]
fn test_is_well_utilised() {
    let texts = sample_texts();
    let group = make_group(&texts);
    let all: Vec<Key> = texts.iter().map(|(k, _, _)| k.clone()).collect();
    assert!(group.is_well_utilised(&all, 75));
    // the three delta-related texts dominate the block; the lone
    // standalone record does not reach 75%.
    assert!(!group.is_well_utilised(&all[3..], 75));
    assert!(group.is_well_utilised(&all[3..], 0));
    assert!(!group.is_well_utilised(&[], 75));
}

#[test]
fn test_rebuild() {
    let texts = sample_texts();
    let mut group = make_group(&texts);
    let keep: Vec<Key> = vec![texts[0].0.clone(), texts[3].0.clone()];

    let mut rebuilt = group.rebuild(&keep, &Config::default()).unwrap();
    assert_eq!(rebuilt.to_keys(), keep);
    for (k, parents, text) in texts.iter() {
        match keep.contains(k) {
            true => {
                assert_eq!(&rebuilt.extract(k).unwrap(), text);
                let entry = rebuilt.as_entries().iter().find(|e| &e.key == k).unwrap();
                assert_eq!(&entry.parents, parents);
            }
            false => assert!(rebuilt.extract(k).is_err()),
        }
    }
    // dropping records shrinks the block.
    assert!(rebuilt.as_block().content_len() < group.as_block().content_len());
}
