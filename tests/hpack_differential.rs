//! Differential HPACK tests against the `hpack` crate
//!
//! Header blocks produced by one implementation are decoded by the other
//! over a long sequence, so any divergence in dynamic table bookkeeping
//! shows up as a wrong or failed decode further down the line.

use bytes::BytesMut;
use httptransport::http::hpack::{Decoder, Encoder, HeaderField};

/// Deterministic header lists mixing repeated, varying and large fields
fn header_lists() -> Vec<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut seed: u32 = 0x9e37_79b9;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    (0..200)
        .map(|i| {
            let mut list: Vec<(Vec<u8>, Vec<u8>)> = vec![
                (b":method".to_vec(), if i % 3 == 0 { b"POST".to_vec() } else { b"GET".to_vec() }),
                (b":scheme".to_vec(), b"https".to_vec()),
                (b":authority".to_vec(), format!("svc-{}.example.com", i % 4).into_bytes()),
                (b":path".to_vec(), format!("/items/{}?page={}", next() % 1000, i).into_bytes()),
                (b"user-agent".to_vec(), b"httptransport-differential/1.0".to_vec()),
                (b"accept".to_vec(), b"application/json".to_vec()),
            ];
            if i % 5 == 0 {
                list.push((b"x-request-id".to_vec(), format!("{:08x}", next()).into_bytes()));
            }
            if i % 7 == 0 {
                // large enough to evict most of the table
                let value: String = (0..1500).map(|n| (b'a' + ((n + i) % 26) as u8) as char).collect();
                list.push((b"x-blob".to_vec(), value.into_bytes()));
            }
            if i % 11 == 0 {
                list.push((b"x-binary".to_vec(), (0..=255u8).collect()));
            }
            list
        })
        .collect()
}

fn to_fields(list: &[(Vec<u8>, Vec<u8>)]) -> Vec<HeaderField> {
    list.iter()
        .map(|(n, v)| HeaderField::new(n.clone(), v.clone()))
        .collect()
}

#[test]
fn test_our_encoder_against_reference_decoder() {
    let mut encoder = Encoder::new();
    let mut reference = hpack::Decoder::new();

    for (i, list) in header_lists().iter().enumerate() {
        let mut block = BytesMut::new();
        encoder.encode(&to_fields(list), &mut block);
        let decoded = reference
            .decode(&block)
            .unwrap_or_else(|e| panic!("block {} rejected: {:?}", i, e));
        assert_eq!(&decoded, list, "block {}", i);
    }
}

#[test]
fn test_reference_encoder_against_our_decoder() {
    let mut reference = hpack::Encoder::new();
    let mut decoder = Decoder::new();

    for (i, list) in header_lists().iter().enumerate() {
        let block = reference.encode(list.iter().map(|(n, v)| (&n[..], &v[..])));
        let decoded = decoder
            .decode(&block)
            .unwrap_or_else(|e| panic!("block {} rejected: {}", i, e));
        assert_eq!(decoded, to_fields(list), "block {}", i);
    }
}

#[test]
fn test_sensitive_fields_against_reference_decoder() {
    let mut encoder = Encoder::new();
    let mut reference = hpack::Decoder::new();

    for round in 0..3 {
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new("authorization", format!("Bearer token-{}", round)),
            HeaderField::sensitive("x-secret", "s3cr3t"),
            HeaderField::new("cookie", "session=abc"),
        ];
        let mut block = BytesMut::new();
        encoder.encode(&fields, &mut block);
        let decoded = reference.decode(&block).unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = fields
            .iter()
            .map(|f| (f.name.to_vec(), f.value.to_vec()))
            .collect();
        assert_eq!(decoded, expected);
    }
    assert!(encoder.table().is_empty());
}

#[test]
fn test_table_size_change_against_reference_decoder() {
    let mut encoder = Encoder::new();
    let mut reference = hpack::Decoder::new();
    let lists = header_lists();

    for (i, list) in lists.iter().take(60).enumerate() {
        if i == 20 {
            encoder.set_max_table_size(512);
        }
        if i == 40 {
            encoder.set_max_table_size(0);
            encoder.set_max_table_size(2048);
        }
        let mut block = BytesMut::new();
        encoder.encode(&to_fields(list), &mut block);
        assert_eq!(&reference.decode(&block).unwrap(), list, "block {}", i);
    }
    assert!(encoder.table().size() <= 2048);
}
