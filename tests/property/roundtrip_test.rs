// tests/property/roundtrip_test.rs

//! Round-trip properties of the wire framing.

use burrow::core::TunnelError;
use burrow::core::frame::{self, ID_LEN, SocketId};
use bytes::BytesMut;
use proptest::prelude::*;

proptest! {
    /// Joining then splitting recovers the payload and id exactly.
    #[test]
    fn frame_round_trip(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        id in any::<u64>(),
    ) {
        let mut buf = BytesMut::from(&payload[..]);
        let message = frame::join(&mut buf, SocketId(id));
        prop_assert_eq!(message.len(), payload.len() + ID_LEN);

        let (split_payload, split_id) = frame::split(&message).unwrap();
        prop_assert_eq!(split_payload, &payload[..]);
        prop_assert_eq!(split_id, SocketId(id));
    }

    /// Every message shorter than the id suffix is rejected, never sliced.
    #[test]
    fn short_messages_are_malformed(len in 0usize..ID_LEN) {
        let message = vec![0xFFu8; len];
        let err = frame::split(&message).unwrap_err();
        prop_assert!(matches!(err, TunnelError::MalformedFrame(reported) if reported == len));
    }

    /// The suffix is the little-endian encoding of the id, wherever the
    /// payload boundary falls.
    #[test]
    fn suffix_is_little_endian(
        payload in proptest::collection::vec(any::<u8>(), 0..128),
        id in any::<u64>(),
    ) {
        let mut buf = BytesMut::from(&payload[..]);
        let message = frame::join(&mut buf, SocketId(id));
        prop_assert_eq!(&message[payload.len()..], &id.to_le_bytes()[..]);
    }
}
