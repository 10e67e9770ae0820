use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A single frame routed by the multiplexer: the textual stream-id it belongs
/// to, plus a chunk of payload bytes. There is no flow-control window here —
/// that's what sets this format apart from an SSH-channel-style protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: String,
    pub data: Bytes,
}

impl Packet {
    pub fn new(id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

/// Maximum size of a single id. Generous enough for any `StreamId` we mint
/// ourselves; guards the decoder against treating garbage as a huge length.
const MAX_ID_LEN: usize = 512;

/// Maximum payload carried by one frame. The multiplexer chunks larger writes
/// into frames this size or smaller before they ever reach the encoder.
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("frame id is not valid UTF-8")]
    InvalidId(#[from] std::string::FromUtf8Error),
    #[error("frame id length {0} exceeds the {MAX_ID_LEN} byte limit")]
    IdTooLong(usize),
    #[error("frame payload length {0} exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLong(usize),
}

/// Wire layout: `u16 id_len | id bytes | u32 data_len | data bytes`, all
/// lengths big-endian. No length-delimited crate is reused here because the
/// format carries two independently-sized fields rather than one.
#[derive(Debug, Default)]
pub struct PacketCodec {
    // Length of the id currently being assembled, once known.
    id_len: Option<u16>,
    // The decoded id, once its bytes are fully buffered.
    id: Option<String>,
    data_len: Option<u32>,
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        if self.id_len.is_none() {
            if src.len() < 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[0], src[1]]);
            if usize::from(len) > MAX_ID_LEN {
                return Err(FrameError::IdTooLong(usize::from(len)));
            }
            src.advance(2);
            self.id_len = Some(len);
        }

        let id_len = usize::from(self.id_len.expect("set above"));

        if self.id.is_none() {
            if src.len() < id_len {
                return Ok(None);
            }
            let id_bytes = src.split_to(id_len);
            self.id = Some(String::from_utf8(id_bytes.to_vec())?);
        }

        if self.data_len.is_none() {
            if src.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            if len as usize > MAX_PAYLOAD_LEN {
                return Err(FrameError::PayloadTooLong(len as usize));
            }
            src.advance(4);
            self.data_len = Some(len);
        }

        let data_len = self.data_len.expect("set above") as usize;

        if src.len() < data_len {
            return Ok(None);
        }

        let data = src.split_to(data_len).freeze();
        let id = self.id.take().expect("set above");
        self.id_len = None;
        self.data_len = None;

        Ok(Some(Packet { id, data }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FrameError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), FrameError> {
        let id_bytes = packet.id.as_bytes();
        if id_bytes.len() > MAX_ID_LEN {
            return Err(FrameError::IdTooLong(id_bytes.len()));
        }
        if packet.data.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(packet.data.len()));
        }

        dst.reserve(2 + id_bytes.len() + 4 + packet.data.len());
        dst.put_u16(id_bytes.len() as u16);
        dst.put_slice(id_bytes);
        dst.put_u32(packet.data.len() as u32);
        dst.put_slice(&packet.data);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        let packet = Packet::new("container-0", Bytes::from_static(b"hello"));
        codec.encode(packet.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_incrementally_as_bytes_trickle_in() {
        let mut codec = PacketCodec::default();
        let mut encode_buf = BytesMut::new();
        codec
            .encode(Packet::new("c-1", Bytes::from_static(b"payload")), &mut encode_buf)
            .unwrap();

        let mut decode_buf = BytesMut::new();
        let mut result = None;
        while !encode_buf.is_empty() {
            decode_buf.put_u8(encode_buf.split_to(1)[0]);
            result = codec.decode(&mut decode_buf).unwrap();
        }

        assert_eq!(result.unwrap().id, "c-1");
    }

    #[test]
    fn rejects_an_oversized_id_length() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u16(MAX_ID_LEN as u16 + 1);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::IdTooLong(_))));
    }

    proptest::proptest! {
        #[test]
        fn round_trips_arbitrary_packets(id in "[a-zA-Z0-9_-]{1,64}", data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096)) {
            let mut codec = PacketCodec::default();
            let mut buf = BytesMut::new();
            let packet = Packet::new(id, Bytes::from(data));
            codec.encode(packet.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            proptest::prop_assert_eq!(decoded, packet);
        }
    }
}
