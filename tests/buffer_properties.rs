//! Byte buffer coverage: length accounting under arbitrary operation
//! sequences, zero-copy moves, line scanning, and the freeze/substr
//! surface, all through the public [`Buffer`] API.

#[macro_use]
mod common;

use common::*;

use evio::{Buffer, BufferError, End, EolStyle};
use proptest::prelude::*;

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

/// One step of a buffer workout, mirrored against a plain `Vec<u8>`.
#[derive(Debug, Clone)]
enum Op {
    Append(Vec<u8>),
    Prepend(Vec<u8>),
    Drain(usize),
    Read(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..512).prop_map(Op::Append),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Op::Prepend),
        (0usize..1024).prop_map(Op::Drain),
        (0usize..1024).prop_map(Op::Read),
    ]
}

proptest! {
    #![proptest_config(test_proptest_config(256))]

    /// Length always equals bytes in minus bytes out, never negative, and
    /// the content matches a flat model buffer byte for byte.
    #[test]
    fn length_tracks_every_operation(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let mut buf = Buffer::new();
        let mut model: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                Op::Append(bytes) => {
                    buf.append(&bytes).unwrap();
                    model.extend_from_slice(&bytes);
                }
                Op::Prepend(bytes) => {
                    buf.prepend(&bytes).unwrap();
                    model.splice(0..0, bytes.iter().copied());
                }
                Op::Drain(n) => {
                    let want = n.min(model.len());
                    let got = buf.drain(n).unwrap();
                    prop_assert_eq!(got, want);
                    model.drain(..want);
                }
                Op::Read(n) => {
                    let got = buf.read(n).unwrap();
                    let want: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    prop_assert_eq!(got, want);
                }
            }
            prop_assert_eq!(buf.len(), model.len());
        }
        prop_assert_eq!(buf.to_vec(), model);
    }

    /// `move_from(A, n)` hands the destination exactly A's first `n`
    /// bytes and shortens A by the same amount, however A is chunked.
    #[test]
    fn move_from_transfers_exact_prefix(
        parts in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8),
        n in 0usize..512,
    ) {
        let mut src = Buffer::new();
        let mut flat = Vec::new();
        for part in &parts {
            src.append(part).unwrap();
            flat.extend_from_slice(part);
        }

        let mut dst = Buffer::new();
        dst.append(b"existing").unwrap();

        let moved = dst.move_from(&mut src, n).unwrap();
        let want = n.min(flat.len());
        prop_assert_eq!(moved, want);
        prop_assert_eq!(src.len(), flat.len() - want);

        dst.drain(8).unwrap();
        let got = dst.read(want).unwrap();
        prop_assert_eq!(got, &flat[..want]);
        prop_assert_eq!(src.to_vec(), &flat[want..]);
    }

    /// `search` agrees with a naive scan over the flattened bytes.
    #[test]
    fn search_matches_naive_scan(
        haystack in proptest::collection::vec(0u8..4, 0..96),
        needle in proptest::collection::vec(0u8..4, 1..4),
        split in 0usize..96,
    ) {
        let mut buf = Buffer::new();
        let cut = split.min(haystack.len());
        buf.append(&haystack[..cut]).unwrap();
        buf.append(&haystack[cut..]).unwrap();

        let naive = haystack
            .windows(needle.len())
            .position(|w| w == needle.as_slice());
        prop_assert_eq!(buf.search(&needle, 0, None), naive);
    }
}

#[test]
fn read_line_style_table() {
    init_test("read_line_style_table");

    // (input, style, lines, remainder)
    let cases: &[(&[u8], EolStyle, &[&[u8]], &[u8])] = &[
        (b"a\nb\n", EolStyle::Lf, &[b"a", b"b"], b""),
        (b"a\r\nb", EolStyle::Lf, &[b"a\r"], b"b"),
        (b"a\r\nb\nc", EolStyle::CrLf, &[b"a", b"b"], b"c"),
        (b"a\nb\r\nc", EolStyle::CrLfStrict, &[b"a\nb"], b"c"),
        (b"a\r\n\r\nb\n", EolStyle::Any, &[b"a", b"b"], b""),
        (b"a\rb\nc", EolStyle::Any, &[b"a", b"b"], b"c"),
    ];

    for (input, style, lines, rest) in cases {
        test_section!(format!("{style:?} over {input:?}"));
        let mut buf = Buffer::new();
        buf.append(input).unwrap();
        for expected in *lines {
            let got = buf.read_line(*style).unwrap();
            assert_with_log!(
                got.as_deref() == Some(*expected),
                "line extracted without its terminator",
                expected,
                got
            );
        }
        let tail = buf.read_line(*style).unwrap();
        assert_with_log!(
            tail.is_none(),
            "no complete line remains",
            Option::<Vec<u8>>::None,
            tail
        );
        assert_with_log!(
            buf.to_vec() == *rest,
            "unterminated remainder left in place",
            rest,
            buf.to_vec()
        );
    }
    test_complete!("read_line_style_table");
}

#[test]
fn search_window_bounds_are_respected() {
    init_test("search_window_bounds_are_respected");

    let mut buf = Buffer::new();
    buf.append(b"xx needle xx needle xx").unwrap();

    assert_eq!(buf.search(b"needle", 0, None), Some(3));
    assert_eq!(buf.search(b"needle", 4, None), Some(13));
    assert_eq!(buf.search(b"needle", 0, Some(8)), None);
    assert_eq!(buf.search(b"needle", 0, Some(9)), Some(3));
    assert_eq!(buf.search(b"absent", 0, None), None);
    assert_eq!(Buffer::new().search(b"x", 0, None), None);
    test_complete!("search_window_bounds_are_respected");
}

#[test]
fn freeze_gates_each_end_independently() {
    init_test("freeze_gates_each_end_independently");

    let mut buf = Buffer::new();
    buf.append(b"payload").unwrap();

    buf.freeze(End::Front);
    assert_with_log!(
        buf.drain(1) == Err(BufferError::Frozen(End::Front)),
        "frozen front rejects draining",
        BufferError::Frozen(End::Front),
        buf.drain(1)
    );
    buf.append(b"!").unwrap();

    buf.freeze(End::Back);
    assert_with_log!(
        buf.append(b"!") == Err(BufferError::Frozen(End::Back)),
        "frozen back rejects appending",
        BufferError::Frozen(End::Back),
        buf.append(b"!")
    );

    buf.unfreeze(End::Front);
    buf.unfreeze(End::Back);
    assert_eq!(buf.read(100).unwrap(), b"payload!");
    test_complete!("freeze_gates_each_end_independently");
}

#[test]
fn substr_and_linearize_leave_content_alone() {
    init_test("substr_and_linearize_leave_content_alone");

    let mut buf = Buffer::new();
    // Two appends large enough to guarantee separate segments.
    let first = vec![b'a'; 5000];
    buf.append(&first).unwrap();
    buf.append(b"trailer").unwrap();
    let len = buf.len();

    assert_eq!(buf.substr(5000, None), b"trailer");
    assert_eq!(buf.substr(4998, Some(4)), b"aatr");
    assert_eq!(buf.substr(len + 10, Some(4)), b"");
    assert_with_log!(buf.len() == len, "substr copied, not drained", len, buf.len());

    let view = buf.linearize(Some(5004));
    assert_eq!(&view[5000..], b"trai");
    assert_with_log!(
        buf.len() == len,
        "linearize reshuffled without losing bytes",
        len,
        buf.len()
    );
    assert!(buf.front_len() >= 5004);
    test_complete!("substr_and_linearize_leave_content_alone");
}

#[test]
fn copy_out_then_read_sees_the_same_bytes() {
    init_test("copy_out_then_read_sees_the_same_bytes");

    let mut buf = Buffer::new();
    buf.append(b"once").unwrap();
    buf.append(b" and again").unwrap();

    let peeked = buf.copy_out(9);
    assert_eq!(peeked, b"once and ");
    let read = buf.read(9).unwrap();
    assert_with_log!(read == peeked, "peek matched the later read", peeked, read);
    assert_eq!(buf.to_vec(), b"again");
    test_complete!("copy_out_then_read_sees_the_same_bytes");
}
