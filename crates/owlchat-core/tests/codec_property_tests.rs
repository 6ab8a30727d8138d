//! Property-based tests for the wire codec
//!
//! These tests verify the framing invariants the connection layer relies
//! on: exact round trips, resumable decoding at any split point, TLV chain
//! idempotence, and that arbitrary input never panics the decoder.

use owlchat_core::protocol::frame::{
    decode_frame, encode_frame, Channel, Frame, FrameBuffer, FrameError,
};
use owlchat_core::protocol::tlv::{decode_tlv_chain, encode_tlv_chain, Tlv, TlvChain};
use owlchat_core::protocol::{Record, UserInfo};
use proptest::prelude::*;

/// Generate arbitrary frame channel, including unassigned values
fn arb_channel() -> impl Strategy<Value = Channel> {
    any::<u8>().prop_map(Channel::from_u8)
}

/// Generate arbitrary frame
fn arb_frame() -> impl Strategy<Value = Frame> {
    (
        arb_channel(),
        any::<u16>(),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(channel, sequence, payload)| {
            Frame::new(channel, payload)
                .expect("payload within bounds")
                .with_sequence(sequence)
        })
}

/// Generate arbitrary TLV entry
fn arb_tlv() -> impl Strategy<Value = Tlv> {
    (any::<u16>(), prop::collection::vec(any::<u8>(), 0..64))
        .prop_map(|(tag, value)| Tlv::new(tag, value).expect("value within bounds"))
}

/// Generate arbitrary TLV chain, duplicates included
fn arb_tlv_chain() -> impl Strategy<Value = TlvChain> {
    prop::collection::vec(arb_tlv(), 0..16).prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    /// Property: decoding an encoded frame yields it back and consumes every byte
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let bytes = encode_frame(&frame);
        let (decoded, consumed) = decode_frame(&bytes).expect("valid frame decodes");
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(decoded.payload_len() as usize, decoded.payload().len());
        prop_assert_eq!(decoded, frame);
    }

    /// Property: a frame split at any point needs more data, then decodes whole
    #[test]
    fn frame_resumable_at_any_split(frame in arb_frame(), split in any::<prop::sample::Index>()) {
        let bytes = encode_frame(&frame);
        let cut = split.index(bytes.len());

        prop_assert_eq!(decode_frame(&bytes[..cut]), Err(FrameError::NeedMoreData));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes[..cut]);
        prop_assert_eq!(buffer.next_frame().expect("partial is not corrupt"), None);
        buffer.extend(&bytes[cut..]);
        prop_assert_eq!(buffer.next_frame().expect("whole frame decodes"), Some(frame));
        prop_assert_eq!(buffer.pending(), 0);
    }

    /// Property: back-to-back frames come out in stream order
    #[test]
    fn frame_stream_order(frames in prop::collection::vec(arb_frame(), 1..8)) {
        let mut buffer = FrameBuffer::new();
        for frame in &frames {
            buffer.extend(&encode_frame(frame));
        }
        for frame in frames {
            prop_assert_eq!(buffer.next_frame().expect("valid stream"), Some(frame));
        }
        prop_assert_eq!(buffer.next_frame().expect("empty buffer"), None);
    }

    /// Property: arbitrary bytes never panic the frame decoder
    #[test]
    fn frame_decoder_total(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        match decode_frame(&bytes) {
            Ok((frame, consumed)) => {
                prop_assert_eq!(consumed, frame.encoded_len());
                prop_assert!(consumed <= bytes.len());
            }
            Err(FrameError::NeedMoreData) | Err(FrameError::Corrupt(_)) => {}
        }
    }

    /// Property: decode(encode(decode(bytes))) == decode(bytes)
    #[test]
    fn tlv_chain_idempotent(chain in arb_tlv_chain()) {
        let bytes = encode_tlv_chain(&chain);
        let first = decode_tlv_chain(&bytes).expect("well-formed chain");
        let second = decode_tlv_chain(&encode_tlv_chain(&first)).expect("re-encoded chain");
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first, chain);
    }

    /// Property: occurrence lookups see duplicates in wire order
    #[test]
    fn tlv_occurrence_order(values in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 1..6)) {
        let chain: TlvChain = values
            .iter()
            .map(|value| Tlv::new(0x0001, value.clone()).expect("small value"))
            .collect();
        let decoded = decode_tlv_chain(&chain.encode()).expect("well-formed chain");
        prop_assert_eq!(decoded.count(0x0001), values.len());
        for (index, value) in values.iter().enumerate() {
            prop_assert_eq!(decoded.get(0x0001, index).expect("present").value(), value.as_slice());
        }
    }

    /// Property: arbitrary bytes never panic the TLV or user info decoders
    #[test]
    fn nested_decoders_total(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = decode_tlv_chain(&bytes);
        let _ = UserInfo::decode(&bytes);
        if let Ok(record) = Record::decode(&bytes) {
            let _ = owlchat_core::protocol::Inbound::decode(&record);
        }
    }

    /// Property: record headers round trip through a data frame
    #[test]
    fn record_round_trip(
        family in any::<u16>(),
        subtype in any::<u16>(),
        request_id in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        let record = Record::new(family, subtype, payload).with_request_id(request_id);
        let frame = record.into_frame().expect("small record");
        prop_assert_eq!(frame.channel(), Channel::Data);
        prop_assert_eq!(Record::from_frame(&frame).expect("data frame"), record);
    }
}
