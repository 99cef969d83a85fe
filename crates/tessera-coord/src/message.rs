//! Master/region-server control messages.
//!
//! Wire format:
//! - tag: u8 (1..=16, see [`MessageKind::tag`])
//! - region: varint length + bytes
//! - payload flag: u8 (0 = absent, 1 = present)
//! - payload?: varint length + bytes
//! - daughter A, daughter B: varint length + bytes (split-with-daughters only)
//!
//! Anything else (unknown tag, bad flag, truncation, trailing bytes) is a
//! corrupt message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::warn;

use crate::error::{CoordError, Result};
use crate::identity::RegionDescriptor;

/// Which side a message travels to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToRegionServer,
    ToMaster,
}

/// Message type. Only the split-with-daughters report carries daughters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RegionOpen,
    RegionClose,
    RegionCloseWithoutReport,
    RegionSplit,
    RegionCompact,
    RegionMajorCompact,
    RegionFlush,
    RegionServerStop,
    RegionServerQuiesce,
    ReportOpen,
    ReportClose,
    ReportProcessOpen,
    ReportSplit,
    ReportSplitIncludesDaughters {
        daughter_a: RegionDescriptor,
        daughter_b: RegionDescriptor,
    },
    ReportExiting,
    ReportQuiesced,
}

const TAG_SPLIT_WITH_DAUGHTERS: u8 = 14;

impl MessageKind {
    /// Wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            MessageKind::RegionOpen => 1,
            MessageKind::RegionClose => 2,
            MessageKind::RegionCloseWithoutReport => 3,
            MessageKind::RegionSplit => 4,
            MessageKind::RegionCompact => 5,
            MessageKind::RegionMajorCompact => 6,
            MessageKind::RegionFlush => 7,
            MessageKind::RegionServerStop => 8,
            MessageKind::RegionServerQuiesce => 9,
            MessageKind::ReportOpen => 10,
            MessageKind::ReportClose => 11,
            MessageKind::ReportProcessOpen => 12,
            MessageKind::ReportSplit => 13,
            MessageKind::ReportSplitIncludesDaughters { .. } => TAG_SPLIT_WITH_DAUGHTERS,
            MessageKind::ReportExiting => 15,
            MessageKind::ReportQuiesced => 16,
        }
    }

    /// Kind for a daughterless tag.
    fn from_plain_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => MessageKind::RegionOpen,
            2 => MessageKind::RegionClose,
            3 => MessageKind::RegionCloseWithoutReport,
            4 => MessageKind::RegionSplit,
            5 => MessageKind::RegionCompact,
            6 => MessageKind::RegionMajorCompact,
            7 => MessageKind::RegionFlush,
            8 => MessageKind::RegionServerStop,
            9 => MessageKind::RegionServerQuiesce,
            10 => MessageKind::ReportOpen,
            11 => MessageKind::ReportClose,
            12 => MessageKind::ReportProcessOpen,
            13 => MessageKind::ReportSplit,
            15 => MessageKind::ReportExiting,
            16 => MessageKind::ReportQuiesced,
            _ => return None,
        })
    }

    pub fn direction(&self) -> Direction {
        if self.tag() <= 9 {
            Direction::ToRegionServer
        } else {
            Direction::ToMaster
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::RegionOpen => "REGION_OPEN",
            MessageKind::RegionClose => "REGION_CLOSE",
            MessageKind::RegionCloseWithoutReport => "REGION_CLOSE_WITHOUT_REPORT",
            MessageKind::RegionSplit => "REGION_SPLIT",
            MessageKind::RegionCompact => "REGION_COMPACT",
            MessageKind::RegionMajorCompact => "REGION_MAJOR_COMPACT",
            MessageKind::RegionFlush => "REGION_FLUSH",
            MessageKind::RegionServerStop => "REGIONSERVER_STOP",
            MessageKind::RegionServerQuiesce => "REGIONSERVER_QUIESCE",
            MessageKind::ReportOpen => "REPORT_OPEN",
            MessageKind::ReportClose => "REPORT_CLOSE",
            MessageKind::ReportProcessOpen => "REPORT_PROCESS_OPEN",
            MessageKind::ReportSplit => "REPORT_SPLIT",
            MessageKind::ReportSplitIncludesDaughters { .. } => "REPORT_SPLIT_INCLUDES_DAUGHTERS",
            MessageKind::ReportExiting => "REPORT_EXITING",
            MessageKind::ReportQuiesced => "REPORT_QUIESCED",
        }
    }
}

/// One control message exchanged between master and a region server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: MessageKind,
    /// Target region; the empty sentinel for server-wide commands
    pub region: RegionDescriptor,
    pub payload: Option<Bytes>,
}

impl ControlMessage {
    pub fn new(kind: MessageKind, region: RegionDescriptor) -> Self {
        Self {
            kind,
            region,
            payload: None,
        }
    }

    /// Message about no particular region.
    pub fn server_wide(kind: MessageKind) -> Self {
        Self::new(kind, RegionDescriptor::empty())
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn region_server_stop() -> Self {
        Self::server_wide(MessageKind::RegionServerStop)
    }

    pub fn region_server_quiesce() -> Self {
        Self::server_wide(MessageKind::RegionServerQuiesce)
    }

    pub fn report_exiting() -> Self {
        Self::server_wide(MessageKind::ReportExiting)
    }

    pub fn report_quiesced() -> Self {
        Self::server_wide(MessageKind::ReportQuiesced)
    }

    /// Split report naming both daughters of `parent`.
    pub fn report_split_with_daughters(
        parent: RegionDescriptor,
        daughter_a: RegionDescriptor,
        daughter_b: RegionDescriptor,
    ) -> Self {
        Self::new(
            MessageKind::ReportSplitIncludesDaughters {
                daughter_a,
                daughter_b,
            },
            parent,
        )
    }

    pub fn direction(&self) -> Direction {
        self.kind.direction()
    }

    pub fn daughter_a(&self) -> Option<&RegionDescriptor> {
        match &self.kind {
            MessageKind::ReportSplitIncludesDaughters { daughter_a, .. } => Some(daughter_a),
            _ => None,
        }
    }

    pub fn daughter_b(&self) -> Option<&RegionDescriptor> {
        match &self.kind {
            MessageKind::ReportSplitIncludesDaughters { daughter_b, .. } => Some(daughter_b),
            _ => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload.as_ref().map_or(0, |p| p.len() + 10);
        let mut buf = BytesMut::with_capacity(1 + 10 + self.region.0.len() + 1 + payload_len);

        buf.put_u8(self.kind.tag());
        put_blob(&mut buf, self.region.as_bytes());
        match &self.payload {
            Some(payload) => {
                buf.put_u8(1);
                put_blob(&mut buf, payload);
            }
            None => buf.put_u8(0),
        }
        if let MessageKind::ReportSplitIncludesDaughters {
            daughter_a,
            daughter_b,
        } = &self.kind
        {
            put_blob(&mut buf, daughter_a.as_bytes());
            put_blob(&mut buf, daughter_b.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Err(CoordError::corrupt("empty message"));
        }
        let tag = cursor.get_u8();
        if !(1..=16).contains(&tag) {
            return Err(CoordError::corrupt(format!("unknown message tag {}", tag)));
        }

        let region = RegionDescriptor::new(take_blob(&mut cursor, "region")?);
        if cursor.is_empty() {
            return Err(CoordError::corrupt("missing payload flag"));
        }
        let payload = match cursor.get_u8() {
            0 => None,
            1 => Some(take_blob(&mut cursor, "payload")?),
            flag => return Err(CoordError::corrupt(format!("invalid payload flag {}", flag))),
        };

        let kind = if tag == TAG_SPLIT_WITH_DAUGHTERS {
            let daughter_a = RegionDescriptor::new(take_blob(&mut cursor, "daughter A")?);
            let daughter_b = RegionDescriptor::new(take_blob(&mut cursor, "daughter B")?);
            MessageKind::ReportSplitIncludesDaughters {
                daughter_a,
                daughter_b,
            }
        } else {
            MessageKind::from_plain_tag(tag)
                .ok_or_else(|| CoordError::corrupt(format!("unknown message tag {}", tag)))?
        };

        if !cursor.is_empty() {
            return Err(CoordError::corrupt(format!(
                "{} trailing bytes after {}",
                cursor.len(),
                kind.name()
            )));
        }
        Ok(Self {
            kind,
            region,
            payload,
        })
    }

    /// Decode, logging and dropping a corrupt message.
    pub fn decode_or_discard(data: &[u8]) -> Option<Self> {
        match Self::decode(data) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(len = data.len(), error = %e, "Discarding corrupt control message");
                None
            }
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.name())?;
        if !self.region.is_empty() {
            write!(f, ": {}", self.region)?;
        }
        if let (Some(a), Some(b)) = (self.daughter_a(), self.daughter_b()) {
            write!(f, " -> [{}, {}]", a, b)?;
        }
        Ok(())
    }
}

fn put_blob(buf: &mut BytesMut, bytes: &[u8]) {
    encode_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

fn take_blob(cursor: &mut &[u8], what: &str) -> Result<Bytes> {
    let len = decode_varint(cursor, what)?;
    if (cursor.len() as u64) < len {
        return Err(CoordError::corrupt(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            cursor.len()
        )));
    }
    let len = len as usize;
    let bytes = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(bytes)
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128).
fn decode_varint(data: &mut &[u8], what: &str) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(CoordError::corrupt(format!("truncated {} length", what)));
        }
        let byte = data.get_u8();
        if shift >= 64 {
            return Err(CoordError::corrupt(format!("{} length overflows", what)));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn region(name: &str) -> RegionDescriptor {
        RegionDescriptor::new(name.as_bytes().to_vec())
    }

    fn plain_kinds() -> Vec<MessageKind> {
        (1..=16u8).filter_map(MessageKind::from_plain_tag).collect()
    }

    fn assert_corrupt(data: &[u8]) {
        let err = ControlMessage::decode(data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptMessage, "{:?}", err);
    }

    #[test]
    fn test_tags_in_order() {
        let kinds = plain_kinds();
        assert_eq!(kinds.len(), 15);
        for kind in &kinds {
            assert_ne!(kind.tag(), TAG_SPLIT_WITH_DAUGHTERS);
            assert_eq!(MessageKind::from_plain_tag(kind.tag()).as_ref(), Some(kind));
        }
        assert_eq!(MessageKind::RegionOpen.tag(), 1);
        assert_eq!(MessageKind::ReportQuiesced.tag(), 16);
    }

    #[test]
    fn test_directions() {
        assert_eq!(
            MessageKind::RegionServerQuiesce.direction(),
            Direction::ToRegionServer
        );
        assert_eq!(MessageKind::ReportOpen.direction(), Direction::ToMaster);
        assert_eq!(
            ControlMessage::report_split_with_daughters(region("p"), region("a"), region("b"))
                .direction(),
            Direction::ToMaster
        );
    }

    #[test]
    fn test_plain_messages_have_no_daughters() {
        for kind in plain_kinds() {
            let msg = ControlMessage::new(kind, region("t1,,1"));
            let decoded = ControlMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
            assert!(decoded.daughter_a().is_none());
            assert!(decoded.daughter_b().is_none());
        }
    }

    #[test]
    fn test_daughters_preserved_in_order() {
        let msg = ControlMessage::report_split_with_daughters(
            region("t1,,1"),
            region("t1,,2"),
            region("t1,m,2"),
        )
        .with_payload(&b"split"[..]);
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.daughter_a(), Some(&region("t1,,2")));
        assert_eq!(decoded.daughter_b(), Some(&region("t1,m,2")));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_sentinel_region() {
        let msg = ControlMessage::region_server_stop();
        assert!(msg.region.is_empty());
        assert_eq!(msg.encode().as_ref(), &[8, 0, 0]);
        assert_eq!(msg.to_string(), "REGIONSERVER_STOP");
    }

    #[test]
    fn test_truncated_daughters_rejected() {
        let msg = ControlMessage::report_split_with_daughters(
            region("parent"),
            region("a"),
            region("bbbb"),
        );
        let encoded = msg.encode();
        for cut in 1..encoded.len() {
            assert_corrupt(&encoded[..cut]);
        }
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert_corrupt(&[]);
        assert_corrupt(&[0, 0, 0]);
        assert_corrupt(&[17, 0, 0]);
        // Bad payload flag.
        assert_corrupt(&[1, 0, 2]);
        // Trailing bytes.
        let mut bytes = ControlMessage::new(MessageKind::RegionOpen, region("r")).encode().to_vec();
        bytes.push(0);
        assert_corrupt(&bytes);
        // Varint that never terminates within 64 bits.
        let mut overflow = vec![1u8];
        overflow.extend(std::iter::repeat(0xFF).take(11));
        assert_corrupt(&overflow);
    }

    #[test]
    fn test_decode_or_discard() {
        assert!(ControlMessage::decode_or_discard(&[42]).is_none());
        let msg = ControlMessage::report_exiting();
        assert_eq!(ControlMessage::decode_or_discard(&msg.encode()), Some(msg));
    }

    fn arb_region() -> impl Strategy<Value = RegionDescriptor> {
        prop::collection::vec(any::<u8>(), 0..64).prop_map(RegionDescriptor::new)
    }

    fn arb_message() -> impl Strategy<Value = ControlMessage> {
        (
            1..=16u8,
            arb_region(),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..256)),
            arb_region(),
            arb_region(),
        )
            .prop_map(|(tag, region, payload, a, b)| {
                let kind = MessageKind::from_plain_tag(tag).unwrap_or(
                    MessageKind::ReportSplitIncludesDaughters {
                        daughter_a: a,
                        daughter_b: b,
                    },
                );
                ControlMessage {
                    kind,
                    region,
                    payload: payload.map(Bytes::from),
                }
            })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(msg in arb_message()) {
            let decoded = ControlMessage::decode(&msg.encode()).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = ControlMessage::decode(&data);
        }
    }
}
