//! Frame layouts byte for byte, as a peer written against the protocol
//! would produce them.

use siteagent::{
    Watermark,
    wire::{Frame, Handshake, Refresh, decode_frame},
};

#[test]
fn test_handshake_layout() {
    let hs = Handshake {
        site: "siteA".to_string(),
        vsites: vec!["p1".to_string(), "proj".to_string()],
    };
    let expected: Vec<u8> = [
        &[0, 0, 0, 5][..],
        b"siteA",
        &[0, 0, 0],
        &[0, 0, 0, 2],
        &[0, 0, 0, 2],
        b"p1",
        &[0, 0],
        &[0, 0, 0, 4],
        b"proj",
    ]
    .concat();
    assert_eq!(hs.to_bytes(), expected);

    let (decoded, used) = decode_frame::<Handshake>(&expected).unwrap().unwrap();
    assert_eq!(decoded, hs);
    assert_eq!(used, expected.len());
}

#[test]
fn test_refresh_layout() {
    let refresh = Refresh::new("proj1", Watermark::new("2024-01-01 10:00:00+00"));
    let bytes = refresh.to_bytes();

    assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
    assert_eq!(&bytes[4..9], b"proj1");
    assert_eq!(&bytes[9..12], &[0, 0, 0]);
    assert_eq!(&bytes[12..16], &[0, 0, 0, 22]);
    assert_eq!(&bytes[16..38], b"2024-01-01 10:00:00+00");
    assert_eq!(&bytes[38..], &[0, 0]);
}

#[test]
fn test_empty_handshake() {
    let hs = Handshake {
        site: String::new(),
        vsites: Vec::new(),
    };
    assert_eq!(hs.to_bytes(), vec![0u8; 8]);
    let (decoded, used) = decode_frame::<Handshake>(&[0u8; 8]).unwrap().unwrap();
    assert_eq!(decoded, hs);
    assert_eq!(used, 8);
}

#[test]
fn test_refresh_split_at_every_byte() {
    let refresh = Refresh::new("proj1", Watermark::new("2024-01-01T10:00:00"));
    let bytes = refresh.to_bytes();
    for cut in 1..bytes.len() {
        let mut buf = bytes[..cut].to_vec();
        assert!(decode_frame::<Refresh>(&buf).unwrap().is_none(), "cut at {cut}");
        buf.extend_from_slice(&bytes[cut..]);
        let (decoded, used) = decode_frame::<Refresh>(&buf).unwrap().unwrap();
        assert_eq!(decoded, refresh);
        assert_eq!(used, bytes.len());
    }
}

#[test]
fn test_refresh_stream_in_every_chunk_size() {
    let frames = vec![
        Refresh::new("proj1", Watermark::new("2024-01-01T10:00:00")),
        Refresh::new("p", Watermark::epoch()),
        Refresh::new("project-with-a-longer-name", Watermark::new("2024-01-02 11:30:00.5+00")),
        Refresh::new("proj1", Watermark::new("2024-01-03T00:00:00")),
    ];
    let stream: Vec<u8> = frames.iter().flat_map(|f| f.to_bytes()).collect();

    for chunk in 1..=stream.len() {
        let mut buf = Vec::new();
        let mut decoded = Vec::new();
        for piece in stream.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some((frame, used)) = decode_frame::<Refresh>(&buf).unwrap() {
                buf.drain(..used);
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames, "chunk size {chunk}");
        assert!(buf.is_empty(), "chunk size {chunk}");
    }
}

#[test]
fn test_garbage_length_is_rejected() {
    let bytes = [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
    assert!(decode_frame::<Refresh>(&bytes).is_err());
}
