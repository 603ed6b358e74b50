//! HPACK codec tests against the examples of RFC 7541 Appendix C
//!
//! Each test runs a sequence of header blocks through one encoder or
//! decoder, so the dynamic table state carried between blocks is checked
//! along with the bytes.

use bytes::BytesMut;
use httptransport::http::hpack::{Decoder, Encoder, HeaderField, HpackError};

fn hex(s: &str) -> Vec<u8> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    digits
        .chunks(2)
        .map(|pair| u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap())
        .collect()
}

fn fields(list: &[(&'static str, &'static str)]) -> Vec<HeaderField> {
    list.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
}

fn encode(encoder: &mut Encoder, list: &[(&'static str, &'static str)]) -> Vec<u8> {
    let mut dst = BytesMut::new();
    encoder.encode(&fields(list), &mut dst);
    dst.to_vec()
}

const REQUEST_1: &[(&str, &str)] = &[
    (":method", "GET"),
    (":scheme", "http"),
    (":path", "/"),
    (":authority", "www.example.com"),
];

const REQUEST_2: &[(&str, &str)] = &[
    (":method", "GET"),
    (":scheme", "http"),
    (":path", "/"),
    (":authority", "www.example.com"),
    ("cache-control", "no-cache"),
];

const REQUEST_3: &[(&str, &str)] = &[
    (":method", "GET"),
    (":scheme", "https"),
    (":path", "/index.html"),
    (":authority", "www.example.com"),
    ("custom-key", "custom-value"),
];

const RESPONSE_1: &[(&str, &str)] = &[
    (":status", "302"),
    ("cache-control", "private"),
    ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
    ("location", "https://www.example.com"),
];

const RESPONSE_2: &[(&str, &str)] = &[
    (":status", "307"),
    ("cache-control", "private"),
    ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
    ("location", "https://www.example.com"),
];

const RESPONSE_3: &[(&str, &str)] = &[
    (":status", "200"),
    ("cache-control", "private"),
    ("date", "Mon, 21 Oct 2013 20:13:22 GMT"),
    ("location", "https://www.example.com"),
    ("content-encoding", "gzip"),
    (
        "set-cookie",
        "foo=ASDJKHQKBZXOQWEOPIUAXQWEOIU; max-age=3600; version=1",
    ),
];

#[test]
fn test_decode_requests_without_huffman() {
    // C.3
    let mut decoder = Decoder::new();

    let block = hex("8286 8441 0f77 7777 2e65 7861 6d70 6c65 2e63 6f6d");
    assert_eq!(decoder.decode(&block).unwrap(), fields(REQUEST_1));
    assert_eq!(decoder.table().size(), 57);

    let block = hex("8286 84be 5808 6e6f 2d63 6163 6865");
    assert_eq!(decoder.decode(&block).unwrap(), fields(REQUEST_2));
    assert_eq!(decoder.table().size(), 110);

    let block = hex(
        "8287 85bf 400a 6375 7374 6f6d 2d6b 6579
         0c63 7573 746f 6d2d 7661 6c75 65",
    );
    assert_eq!(decoder.decode(&block).unwrap(), fields(REQUEST_3));
    assert_eq!(decoder.table().size(), 164);
    assert_eq!(decoder.table().len(), 3);
}

#[test]
fn test_decode_requests_with_huffman() {
    // C.4
    let mut decoder = Decoder::new();

    let block = hex("8286 8441 8cf1 e3c2 e5f2 3a6b a0ab 90f4 ff");
    assert_eq!(decoder.decode(&block).unwrap(), fields(REQUEST_1));

    let block = hex("8286 84be 5886 a8eb 1064 9cbf");
    assert_eq!(decoder.decode(&block).unwrap(), fields(REQUEST_2));

    let block = hex("8287 85bf 4088 25a8 49e9 5ba9 7d7f 8925 a849 e95b b8e8 b4bf");
    assert_eq!(decoder.decode(&block).unwrap(), fields(REQUEST_3));
    assert_eq!(decoder.table().size(), 164);
}

#[test]
fn test_encode_requests_matches_rfc_bytes() {
    // The encoder picks Huffman when shorter and indexes these fields, so
    // its output is exactly C.4
    let mut encoder = Encoder::new();

    assert_eq!(
        encode(&mut encoder, REQUEST_1),
        hex("8286 8441 8cf1 e3c2 e5f2 3a6b a0ab 90f4 ff")
    );
    assert_eq!(encoder.table().size(), 57);

    assert_eq!(
        encode(&mut encoder, REQUEST_2),
        hex("8286 84be 5886 a8eb 1064 9cbf")
    );
    assert_eq!(encoder.table().size(), 110);

    assert_eq!(
        encode(&mut encoder, REQUEST_3),
        hex("8287 85bf 4088 25a8 49e9 5ba9 7d7f 8925 a849 e95b b8e8 b4bf")
    );
    assert_eq!(encoder.table().size(), 164);
}

#[test]
fn test_decode_responses_with_eviction() {
    // C.5: a 256 byte table forces evictions between responses
    let mut decoder = Decoder::new();
    decoder.set_max_allowed_table_size(256);

    let block = hex(
        "4803 3330 3258 0770 7269 7661 7465 611d
         4d6f 6e2c 2032 3120 4f63 7420 3230 3133
         2032 303a 3133 3a32 3120 474d 546e 1768
         7474 7073 3a2f 2f77 7777 2e65 7861 6d70
         6c65 2e63 6f6d",
    );
    assert_eq!(decoder.decode(&block).unwrap(), fields(RESPONSE_1));
    assert_eq!(decoder.table().size(), 222);

    let block = hex("4803 3330 37c1 c0bf");
    assert_eq!(decoder.decode(&block).unwrap(), fields(RESPONSE_2));
    assert_eq!(decoder.table().size(), 222);

    let block = hex(
        "88c1 611d 4d6f 6e2c 2032 3120 4f63 7420
         3230 3133 2032 303a 3133 3a32 3220 474d
         54c0 5a04 677a 6970 7738 666f 6f3d 4153
         444a 4b48 514b 425a 584f 5157 454f 5049
         5541 5851 5745 4f49 553b 206d 6178 2d61
         6765 3d33 3630 303b 2076 6572 7369 6f6e
         3d31",
    );
    assert_eq!(decoder.decode(&block).unwrap(), fields(RESPONSE_3));
    assert_eq!(decoder.table().size(), 215);
    assert_eq!(decoder.table().len(), 3);
}

#[test]
fn test_decode_huffman_responses_with_eviction() {
    // C.6
    let mut decoder = Decoder::new();
    decoder.set_max_allowed_table_size(256);

    let block = hex(
        "4882 6402 5885 aec3 771a 4b61 96d0 7abe
         9410 54d4 44a8 2005 9504 0b81 66e0 82a6
         2d1b ff6e 919d 29ad 1718 63c7 8f0b 97c8
         e9ae 82ae 43d3",
    );
    assert_eq!(decoder.decode(&block).unwrap(), fields(RESPONSE_1));

    let block = hex("4883 640e ffc1 c0bf");
    assert_eq!(decoder.decode(&block).unwrap(), fields(RESPONSE_2));

    let block = hex(
        "88c1 6196 d07a be94 1054 d444 a820 0595
         040b 8166 e084 a62d 1bff c05a 839b d9ab
         77ad 94e7 821d d7f2 e6c7 b335 dfdf cd5b
         3960 d5af 2708 7f36 72c1 ab27 0fb5 291f
         9587 3160 65c0 03ed 4ee5 b106 3d50 07",
    );
    assert_eq!(decoder.decode(&block).unwrap(), fields(RESPONSE_3));
    assert_eq!(decoder.table().size(), 215);
}

#[test]
fn test_encoder_and_decoder_stay_in_sync_through_table_resizes() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    let list: Vec<HeaderField> = (0..40)
        .map(|i| HeaderField::new(format!("x-field-{}", i), format!("value-{}", i * 31)))
        .collect();

    for (round, size) in [4096usize, 256, 0, 1024, 4096].into_iter().enumerate() {
        encoder.set_max_table_size(size);
        let mut block = BytesMut::new();
        encoder.encode(&list, &mut block);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded, list, "round {}", round);
        assert_eq!(decoder.table().size(), encoder.table().size(), "round {}", round);
        assert!(decoder.table().size() <= size);
    }
}

#[test]
fn test_sensitive_fields_survive_decoding() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    let list = vec![
        HeaderField::new(":method", "GET"),
        HeaderField::sensitive("x-api-key", "k-123"),
        HeaderField::new("authorization", "Basic Zm9vOmJhcg=="),
    ];
    let mut block = BytesMut::new();
    encoder.encode(&list, &mut block);
    let decoded = decoder.decode(&block).unwrap();

    assert_eq!(decoded, list);
    assert!(!decoded[0].sensitive);
    assert!(decoded[1].sensitive);
    assert!(decoded[2].sensitive);
    // never-indexed fields do not reach either table
    assert!(encoder.table().is_empty());
    assert!(decoder.table().is_empty());
}

#[test]
fn test_header_list_limit() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();
    decoder.set_max_header_list_size(100);

    let small = fields(&[("a", "b")]);
    let large = vec![HeaderField::new("x-large", "v".repeat(200))];

    let mut block = BytesMut::new();
    encoder.encode(&large, &mut block);
    assert_eq!(
        decoder.decode(&block),
        Err(HpackError::HeaderListTooLarge(100))
    );

    // the oversized block still went through the table, later blocks decode
    let mut block = BytesMut::new();
    encoder.encode(&small, &mut block);
    assert_eq!(decoder.decode(&block).unwrap(), small);
}

#[test]
fn test_malformed_blocks_are_rejected() {
    let mut decoder = Decoder::new();
    // index 0
    assert_eq!(decoder.decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
    // dynamic index past the end of an empty table
    assert_eq!(decoder.decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
    // literal whose value length runs past the block
    assert_eq!(
        decoder.decode(&hex("4005 6865 6c6c")),
        Err(HpackError::StringTruncated)
    );
    // size update above the advertised maximum
    let mut decoder = Decoder::new();
    decoder.set_max_allowed_table_size(100);
    assert!(matches!(
        decoder.decode(&hex("3fe1 1f")),
        Err(HpackError::SizeUpdateTooLarge { requested: 4096, max: 100 })
    ));
}
