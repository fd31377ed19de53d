use std::io::Read;

use super::*;

fn inflate(data: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    let mut dec = flate2::read::ZlibDecoder::new(data);
    dec.read_to_end(&mut out).unwrap();
    out
}

fn digit_lines() -> Vec<Vec<u8>> {
    // lines of concatenated numbers, poorly compressible enough to
    // overflow a 4K chunk before the list runs out.
    (0..64)
        .map(|group| {
            let mut line = String::new();
            for n in (group * 50)..(group * 50 + 50) {
                line.push_str(&n.to_string());
            }
            line.push('\n');
            line.into_bytes()
        })
        .collect()
}

#[test]
fn test_chunk_writer_empty() {
    let writer = ChunkWriter::new(4096, 0);
    let (bytes, padding) = writer.finish().unwrap();
    assert_eq!(bytes.len(), 4096);
    assert_eq!(inflate(&bytes), b"".to_vec());
    // only a zlib header and trailer.
    assert!(padding > 4080, "padding {}", padding);
}

#[test]
fn test_some_data() {
    let mut writer = ChunkWriter::new(4096, 0);
    assert!(!writer.write(b"foo bar baz quux\n").unwrap());
    assert_eq!(writer.to_items_len(), 17);
    let (bytes, padding) = writer.finish().unwrap();
    assert_eq!(bytes.len(), 4096);
    assert_eq!(inflate(&bytes), b"foo bar baz quux\n".to_vec());
    assert!(padding > 4000, "padding {}", padding);
}

#[test]
fn test_too_much_data_does_not_exceed_size() {
    let lines = digit_lines();
    let mut writer = ChunkWriter::new(4096, 0);
    let mut accepted = vec![];
    for line in lines.iter() {
        if writer.write(line).unwrap() {
            break;
        }
        accepted.push(line.clone());
    }
    // the chunk must overflow before the input runs out.
    assert!(accepted.len() < lines.len());
    assert!(accepted.len() > 20, "accepted {}", accepted.len());
    assert_eq!(writer.to_num_repack(), 1);

    let (bytes, _) = writer.finish().unwrap();
    assert_eq!(bytes.len(), 4096);
    let expected: Vec<u8> = accepted.into_iter().flatten().collect();
    assert_eq!(inflate(&bytes), expected);
}

#[test]
fn test_too_much_data_preserves_reserve_space() {
    let lines = digit_lines();
    let mut writer = ChunkWriter::new(4096, 256);
    let mut accepted = vec![];
    for line in lines.iter() {
        if writer.write(line).unwrap() {
            break;
        }
        accepted.push(line.clone());
    }
    assert!(accepted.len() < lines.len());
    // the reserved write still fits.
    assert!(!writer.write_reserved(&[b'A'; 256]).unwrap());

    let (bytes, _) = writer.finish().unwrap();
    assert_eq!(bytes.len(), 4096);
    let mut expected: Vec<u8> = accepted.into_iter().flatten().collect();
    expected.extend_from_slice(&[b'A'; 256]);
    assert_eq!(inflate(&bytes), expected);
}

#[test]
fn test_oversize_entry() {
    let mut writer = ChunkWriter::new(512, 0);
    // incompressible data larger than the whole chunk, with nothing
    // accepted before it.
    let seed = [7_u8; 32];
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    let mut rng = SmallRng::from_seed(seed);
    let data: Vec<u8> = (0..2048).map(|_| rng.gen::<u8>()).collect();
    assert!(writer.write(&data).is_err());
}

#[test]
fn test_small_chunks_round_trip() {
    for chunk_size in [512, 1024, 4096].iter() {
        let mut writer = ChunkWriter::new(*chunk_size, 0);
        let mut expected = vec![];
        for i in 0..1000 {
            let line = format!("entry number {} with some text\n", i);
            if writer.write(line.as_bytes()).unwrap() {
                break;
            }
            expected.extend_from_slice(line.as_bytes());
        }
        let (bytes, _) = writer.finish().unwrap();
        assert_eq!(bytes.len(), *chunk_size);
        assert_eq!(inflate(&bytes), expected);
    }
}
