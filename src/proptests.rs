use super::*;

use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::HashMap;
use std::convert::Infallible;

/// Recover the exact bytes a chunk consumed from its packed value.
fn unpack(chunk: Chunk, width: usize) -> Vec<u8> {
    (0..chunk.consumed)
        .map(|i| (chunk.value >> (8 * (width - 1 - i))) as u8)
        .collect()
}

fn raw_pool(width: usize) -> BytePool<Vec<u8>, impl Materializer<Vec<u8>, Error = Infallible>> {
    BytePool::with_config(
        |bytes: &[u8]| Ok(bytes.to_vec()),
        Config { chunk_width: width },
    )
}

fn addr<V>(v: &V) -> usize {
    v as *const V as usize
}

proptest! {
    #[test]
    fn chunks_cover_key_exactly(key in vec(any::<u8>(), 0..40), width in 1usize..=8) {
        let chunks: Vec<Chunk> = Chunks::new(&key, width).collect();
        prop_assert_eq!(chunks.len(), key.len().div_ceil(width));

        let mut rebuilt = Vec::new();
        for (i, c) in chunks.iter().enumerate() {
            prop_assert_eq!(c.is_final, i + 1 == chunks.len());
            if !c.is_final {
                prop_assert_eq!(c.consumed, width);
            }
            rebuilt.extend(unpack(*c, width));
        }
        prop_assert_eq!(rebuilt, key);
    }

    #[test]
    fn interning_matches_hashmap_model(
        // A tiny alphabet forces duplicate keys, shared prefixes and
        // trailing-zero disambiguation cases.
        keys in vec(vec(0u8..4, 0..12), 0..64),
        width in 1usize..=8,
    ) {
        let pool = raw_pool(width);
        let mut model: HashMap<Vec<u8>, usize> = HashMap::new();

        for key in &keys {
            let got = addr(pool.get_or_create(key).unwrap());
            if let Some(&expected) = model.get(key) {
                prop_assert_eq!(got, expected);
            } else {
                model.insert(key.clone(), got);
            }
        }

        prop_assert_eq!(pool.size().unwrap(), model.len());
        for (key, &expected) in &model {
            prop_assert_eq!(addr(pool.get_or_create(key).unwrap()), expected);
            prop_assert_eq!(pool.get(key).unwrap().map(addr), Some(expected));
            prop_assert_eq!(pool.get_or_create(key).unwrap(), key);
        }
    }

    #[test]
    fn prefixes_never_share_an_instance(key in vec(any::<u8>(), 1..16), width in 1usize..=8) {
        let pool = raw_pool(width);
        let full = addr(pool.get_or_create(&key).unwrap());
        for cut in 0..key.len() {
            let prefix = addr(pool.get_or_create(&key[..cut]).unwrap());
            prop_assert_ne!(full, prefix);
        }
        // The full key plus every proper prefix, each a distinct length.
        prop_assert_eq!(pool.size().unwrap(), key.len() + 1);
    }
}
