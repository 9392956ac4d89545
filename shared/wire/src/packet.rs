//! Binary packet families on the media wire.
//!
//! Two families share one namespace of 1-byte type tags:
//! - control: AUTH, AUTH_ACK, DISCONNECT, GROUP_OP, GROUP_STATE, GROUP_LIST,
//!   SERVER_SHUTDOWN, DISCONNECT_ACK, PLAYER_NAME
//! - media: AUDIO, TEST_AUDIO
//!
//! Everything is big-endian; strings are u16-length-prefixed UTF-8.
//!
//! Media layout (short-id form, 14-byte header):
//!   0      type
//!   1      codec tag; high bit = position present, low 7 bits = codec id
//!   2..6   sender short id (u32)
//!   6..10  sequence number (u32)
//!   10..14 payload length L (u32)
//!   14..   payload (L bytes)
//!   +L..   optional 12 bytes: x, y, z as f32 when the position bit is set
//!
//! A legacy variant carries the full 128-bit sender id in place of the short
//! id (26-byte header). Decoding accepts both; the forms are told apart by the
//! exact-length equation, short form winning if both happen to fit.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::ident::ShortId;

pub const TYPE_AUTH: u8 = 0x01;
pub const TYPE_AUDIO: u8 = 0x02;
pub const TYPE_AUTH_ACK: u8 = 0x03;
pub const TYPE_DISCONNECT: u8 = 0x04;
pub const TYPE_TEST_AUDIO: u8 = 0x05;
pub const TYPE_GROUP_OP: u8 = 0x06;
pub const TYPE_GROUP_STATE: u8 = 0x07;
pub const TYPE_GROUP_LIST: u8 = 0x08;
pub const TYPE_SERVER_SHUTDOWN: u8 = 0x09;
pub const TYPE_DISCONNECT_ACK: u8 = 0x0A;
pub const TYPE_PLAYER_NAME: u8 = 0x0B;

pub const MEDIA_HEADER_SHORT: usize = 14;
pub const MEDIA_HEADER_LEGACY: usize = 26;
const POSITION_BYTES: usize = 12;
const POSITION_FLAG: u8 = 0x80;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("malformed packet")]
    Malformed,
    #[error("invalid utf-8 in string field")]
    BadString,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecTag {
    Pcm = 0x00,
    Opus = 0x01,
}

impl CodecTag {
    pub fn from_id(id: u8) -> Result<Self, WireError> {
        match id {
            0x00 => Ok(Self::Pcm),
            0x01 => Ok(Self::Opus),
            _ => Err(WireError::Malformed),
        }
    }
}

/// Sender identification on a media frame: the announced short form, or the
/// legacy full id for peers that predate the PLAYER_NAME announcement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderRef {
    Short(ShortId),
    Full(Uuid),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaFrame {
    pub codec: CodecTag,
    pub sender: SenderRef,
    pub seq: u32,
    pub payload: Bytes,
    pub position: Option<[f32; 3]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthCode {
    Accepted = 0,
    PlayerNotFound = 1,
    ServerNotReady = 2,
    InvalidCredentials = 3,
}

impl AuthCode {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::PlayerNotFound),
            2 => Ok(Self::ServerNotReady),
            3 => Ok(Self::InvalidCredentials),
            _ => Err(WireError::Malformed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupOpKind {
    Create = 0,
    Join = 1,
    Leave = 2,
    UpdateSettings = 3,
}

impl GroupOpKind {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Create),
            1 => Ok(Self::Join),
            2 => Ok(Self::Leave),
            3 => Ok(Self::UpdateSettings),
            _ => Err(WireError::Malformed),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupOp {
    pub op: GroupOpKind,
    pub group: Uuid,
    pub name: String,
    pub permanent: bool,
    pub isolated: bool,
    pub max_members: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupDescriptor {
    pub id: Uuid,
    pub name: String,
    pub permanent: bool,
    pub isolated: bool,
    pub member_count: u16,
    pub max_members: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Auth { player: Uuid, secret: String },
    AuthAck { code: AuthCode, sample_rate: u32 },
    Disconnect { reason: String },
    GroupOp(GroupOp),
    GroupState {
        id: Uuid,
        name: String,
        permanent: bool,
        isolated: bool,
        max_members: u16,
        members: Vec<Uuid>,
    },
    GroupList { groups: Vec<GroupDescriptor> },
    ServerShutdown,
    DisconnectAck { reason: String },
    PlayerName { player: Uuid, short: ShortId, name: String },
    Audio(MediaFrame),
    TestAudio(MediaFrame),
}

const FLAG_PERMANENT: u8 = 0x01;
const FLAG_ISOLATED: u8 = 0x02;

impl Packet {
    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(64);
        match self {
            Packet::Auth { player, secret } => {
                b.put_u8(TYPE_AUTH);
                b.put_slice(player.as_bytes());
                put_str(&mut b, secret);
            }
            Packet::AuthAck { code, sample_rate } => {
                b.put_u8(TYPE_AUTH_ACK);
                b.put_u8(*code as u8);
                b.put_u32(*sample_rate);
            }
            Packet::Disconnect { reason } => {
                b.put_u8(TYPE_DISCONNECT);
                put_str(&mut b, reason);
            }
            Packet::GroupOp(op) => {
                b.put_u8(TYPE_GROUP_OP);
                b.put_u8(op.op as u8);
                b.put_slice(op.group.as_bytes());
                put_str(&mut b, &op.name);
                b.put_u8(group_flags(op.permanent, op.isolated));
                b.put_u16(op.max_members);
            }
            Packet::GroupState { id, name, permanent, isolated, max_members, members } => {
                b.put_u8(TYPE_GROUP_STATE);
                b.put_slice(id.as_bytes());
                put_str(&mut b, name);
                b.put_u8(group_flags(*permanent, *isolated));
                b.put_u16(*max_members);
                b.put_u16(members.len() as u16);
                for m in members {
                    b.put_slice(m.as_bytes());
                }
            }
            Packet::GroupList { groups } => {
                b.put_u8(TYPE_GROUP_LIST);
                b.put_u16(groups.len() as u16);
                for g in groups {
                    b.put_slice(g.id.as_bytes());
                    put_str(&mut b, &g.name);
                    b.put_u8(group_flags(g.permanent, g.isolated));
                    b.put_u16(g.member_count);
                    b.put_u16(g.max_members);
                }
            }
            Packet::ServerShutdown => {
                b.put_u8(TYPE_SERVER_SHUTDOWN);
            }
            Packet::DisconnectAck { reason } => {
                b.put_u8(TYPE_DISCONNECT_ACK);
                put_str(&mut b, reason);
            }
            Packet::PlayerName { player, short, name } => {
                b.put_u8(TYPE_PLAYER_NAME);
                b.put_slice(player.as_bytes());
                b.put_u32(short.0);
                put_str(&mut b, name);
            }
            Packet::Audio(f) => encode_media(&mut b, TYPE_AUDIO, f),
            Packet::TestAudio(f) => encode_media(&mut b, TYPE_TEST_AUDIO, f),
        }
        b.freeze()
    }

    /// Decode one datagram. Any bounds violation yields an error and no
    /// partial state; control packets with trailing bytes are malformed.
    pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
        let ty = *buf.first().ok_or(WireError::Empty)?;
        match ty {
            TYPE_AUDIO | TYPE_TEST_AUDIO => {
                let frame = decode_media(buf)?;
                if ty == TYPE_AUDIO {
                    Ok(Packet::Audio(frame))
                } else {
                    Ok(Packet::TestAudio(frame))
                }
            }
            TYPE_AUTH => {
                let mut r = Reader::new(&buf[1..]);
                let player = r.uuid()?;
                let secret = r.string()?;
                r.finish()?;
                Ok(Packet::Auth { player, secret })
            }
            TYPE_AUTH_ACK => {
                let mut r = Reader::new(&buf[1..]);
                let code = AuthCode::from_u8(r.u8()?)?;
                let sample_rate = r.u32()?;
                r.finish()?;
                Ok(Packet::AuthAck { code, sample_rate })
            }
            TYPE_DISCONNECT => {
                let mut r = Reader::new(&buf[1..]);
                let reason = r.string()?;
                r.finish()?;
                Ok(Packet::Disconnect { reason })
            }
            TYPE_GROUP_OP => {
                let mut r = Reader::new(&buf[1..]);
                let op = GroupOpKind::from_u8(r.u8()?)?;
                let group = r.uuid()?;
                let name = r.string()?;
                let flags = r.u8()?;
                let max_members = r.u16()?;
                r.finish()?;
                Ok(Packet::GroupOp(GroupOp {
                    op,
                    group,
                    name,
                    permanent: flags & FLAG_PERMANENT != 0,
                    isolated: flags & FLAG_ISOLATED != 0,
                    max_members,
                }))
            }
            TYPE_GROUP_STATE => {
                let mut r = Reader::new(&buf[1..]);
                let id = r.uuid()?;
                let name = r.string()?;
                let flags = r.u8()?;
                let max_members = r.u16()?;
                let count = r.u16()? as usize;
                let mut members = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    members.push(r.uuid()?);
                }
                r.finish()?;
                Ok(Packet::GroupState {
                    id,
                    name,
                    permanent: flags & FLAG_PERMANENT != 0,
                    isolated: flags & FLAG_ISOLATED != 0,
                    max_members,
                    members,
                })
            }
            TYPE_GROUP_LIST => {
                let mut r = Reader::new(&buf[1..]);
                let count = r.u16()? as usize;
                let mut groups = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    let id = r.uuid()?;
                    let name = r.string()?;
                    let flags = r.u8()?;
                    let member_count = r.u16()?;
                    let max_members = r.u16()?;
                    groups.push(GroupDescriptor {
                        id,
                        name,
                        permanent: flags & FLAG_PERMANENT != 0,
                        isolated: flags & FLAG_ISOLATED != 0,
                        member_count,
                        max_members,
                    });
                }
                r.finish()?;
                Ok(Packet::GroupList { groups })
            }
            TYPE_SERVER_SHUTDOWN => {
                Reader::new(&buf[1..]).finish()?;
                Ok(Packet::ServerShutdown)
            }
            TYPE_DISCONNECT_ACK => {
                let mut r = Reader::new(&buf[1..]);
                let reason = r.string()?;
                r.finish()?;
                Ok(Packet::DisconnectAck { reason })
            }
            TYPE_PLAYER_NAME => {
                let mut r = Reader::new(&buf[1..]);
                let player = r.uuid()?;
                let short = ShortId(r.u32()?);
                let name = r.string()?;
                r.finish()?;
                Ok(Packet::PlayerName { player, short, name })
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

fn group_flags(permanent: bool, isolated: bool) -> u8 {
    let mut f = 0;
    if permanent {
        f |= FLAG_PERMANENT;
    }
    if isolated {
        f |= FLAG_ISOLATED;
    }
    f
}

fn encode_media(b: &mut BytesMut, ty: u8, f: &MediaFrame) {
    b.reserve(MEDIA_HEADER_LEGACY + f.payload.len() + POSITION_BYTES);
    b.put_u8(ty);
    let mut tag = f.codec as u8 & 0x7F;
    if f.position.is_some() {
        tag |= POSITION_FLAG;
    }
    b.put_u8(tag);
    match f.sender {
        SenderRef::Short(s) => b.put_u32(s.0),
        SenderRef::Full(u) => b.put_slice(u.as_bytes()),
    }
    b.put_u32(f.seq);
    b.put_u32(f.payload.len() as u32);
    b.put_slice(&f.payload);
    if let Some([x, y, z]) = f.position {
        b.put_f32(x);
        b.put_f32(y);
        b.put_f32(z);
    }
}

fn decode_media(buf: &[u8]) -> Result<MediaFrame, WireError> {
    if buf.len() < MEDIA_HEADER_SHORT {
        return Err(WireError::Malformed);
    }
    let tag = buf[1];
    let codec = CodecTag::from_id(tag & 0x7F)?;
    let has_pos = tag & POSITION_FLAG != 0;
    let trailer = if has_pos { POSITION_BYTES } else { 0 };

    // Short form first: the declared payload length must account for the
    // datagram exactly. Fall back to the legacy 128-bit-sender layout.
    let short_len = be_u32(&buf[10..14]) as usize;
    if MEDIA_HEADER_SHORT + short_len + trailer == buf.len() {
        let sender = SenderRef::Short(ShortId(be_u32(&buf[2..6])));
        let seq = be_u32(&buf[6..10]);
        let payload = Bytes::copy_from_slice(&buf[14..14 + short_len]);
        let position = has_pos.then(|| read_position(&buf[14 + short_len..]));
        return Ok(MediaFrame { codec, sender, seq, payload, position });
    }

    if buf.len() >= MEDIA_HEADER_LEGACY {
        let legacy_len = be_u32(&buf[22..26]) as usize;
        if MEDIA_HEADER_LEGACY + legacy_len + trailer == buf.len() {
            let sender = SenderRef::Full(
                Uuid::from_slice(&buf[2..18]).map_err(|_| WireError::Malformed)?,
            );
            let seq = be_u32(&buf[18..22]);
            let payload = Bytes::copy_from_slice(&buf[26..26 + legacy_len]);
            let position = has_pos.then(|| read_position(&buf[26 + legacy_len..]));
            return Ok(MediaFrame { codec, sender, seq, payload, position });
        }
    }

    Err(WireError::Malformed)
}

fn read_position(buf: &[u8]) -> [f32; 3] {
    [
        f32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        f32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        f32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    ]
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn put_str(b: &mut BytesMut, s: &str) {
    b.put_u16(s.len() as u16);
    b.put_slice(s.as_bytes());
}

/// Bounds-checked sequential reader. Every accessor fails before reading past
/// the datagram boundary.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Malformed)?;
        if end > self.buf.len() {
            return Err(WireError::Malformed);
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn uuid(&mut self) -> Result<Uuid, WireError> {
        let s = self.take(16)?;
        Uuid::from_slice(s).map_err(|_| WireError::Malformed)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u16()? as usize;
        let s = self.take(len)?;
        String::from_utf8(s.to_vec()).map_err(|_| WireError::BadString)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(WireError::Malformed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sender: SenderRef, position: Option<[f32; 3]>) -> MediaFrame {
        MediaFrame {
            codec: CodecTag::Opus,
            sender,
            seq: 0x01020304,
            payload: Bytes::from_static(&[0xAB; 60]),
            position,
        }
    }

    #[test]
    fn audio_short_round_trip() {
        let p = Packet::Audio(frame(SenderRef::Short(ShortId(0xDEADBEEF)), None));
        let bytes = p.encode();
        assert_eq!(bytes.len(), MEDIA_HEADER_SHORT + 60);
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn audio_short_with_position_round_trip() {
        let p = Packet::Audio(frame(
            SenderRef::Short(ShortId(7)),
            Some([1.5, -2.0, 300.25]),
        ));
        let bytes = p.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn audio_legacy_round_trip() {
        let p = Packet::Audio(frame(SenderRef::Full(Uuid::new_v4()), Some([0.0, 64.0, 0.0])));
        let bytes = p.encode();
        assert_eq!(bytes.len(), MEDIA_HEADER_LEGACY + 60 + 12);
        assert_eq!(Packet::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn media_header_big_endian_offsets() {
        let p = Packet::Audio(MediaFrame {
            codec: CodecTag::Opus,
            sender: SenderRef::Short(ShortId(0x090A0B0C)),
            seq: 0x01020304,
            payload: Bytes::from_static(&[0xFF; 4]),
            position: None,
        });
        let b = p.encode();
        assert_eq!(b[0], TYPE_AUDIO);
        assert_eq!(b[1], 0x01); // opus, no position bit
        assert_eq!(&b[2..6], &[0x09, 0x0A, 0x0B, 0x0C]);
        assert_eq!(&b[6..10], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&b[10..14], &[0x00, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn position_flag_is_high_bit_of_codec_tag() {
        let p = Packet::TestAudio(frame(SenderRef::Short(ShortId(1)), Some([0.0, 0.0, 0.0])));
        let b = p.encode();
        assert_eq!(b[0], TYPE_TEST_AUDIO);
        assert_eq!(b[1], 0x81);
    }

    #[test]
    fn declared_length_past_boundary_is_malformed() {
        let p = Packet::Audio(frame(SenderRef::Short(ShortId(1)), None));
        let mut b = p.encode().to_vec();
        // Inflate the payload length field past the datagram end.
        b[10..14].copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(Packet::decode(&b), Err(WireError::Malformed)));
    }

    #[test]
    fn truncated_media_header_is_malformed() {
        let p = Packet::Audio(frame(SenderRef::Short(ShortId(1)), None));
        let b = p.encode();
        for cut in [1usize, 5, 13] {
            assert!(Packet::decode(&b[..cut]).is_err());
        }
    }

    #[test]
    fn empty_and_unknown_type() {
        assert_eq!(Packet::decode(&[]), Err(WireError::Empty));
        assert_eq!(Packet::decode(&[0x7F]), Err(WireError::UnknownType(0x7F)));
    }

    #[test]
    fn auth_round_trip() {
        let p = Packet::Auth { player: Uuid::new_v4(), secret: "s3cret".into() };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn auth_ack_round_trip() {
        let p = Packet::AuthAck { code: AuthCode::ServerNotReady, sample_rate: 48_000 };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn auth_truncated_secret_is_malformed() {
        let p = Packet::Auth { player: Uuid::new_v4(), secret: "secret".into() };
        let b = p.encode();
        assert_eq!(Packet::decode(&b[..b.len() - 2]), Err(WireError::Malformed));
    }

    #[test]
    fn control_trailing_bytes_are_malformed() {
        let p = Packet::Disconnect { reason: "bye".into() };
        let mut b = p.encode().to_vec();
        b.push(0x00);
        assert_eq!(Packet::decode(&b), Err(WireError::Malformed));
    }

    #[test]
    fn group_op_round_trip() {
        let p = Packet::GroupOp(GroupOp {
            op: GroupOpKind::Create,
            group: Uuid::nil(),
            name: "raid".into(),
            permanent: true,
            isolated: false,
            max_members: 8,
        });
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn group_state_round_trip() {
        let p = Packet::GroupState {
            id: Uuid::new_v4(),
            name: "ops".into(),
            permanent: false,
            isolated: true,
            max_members: 16,
            members: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn group_list_round_trip() {
        let p = Packet::GroupList {
            groups: vec![
                GroupDescriptor {
                    id: Uuid::new_v4(),
                    name: "a".into(),
                    permanent: false,
                    isolated: false,
                    member_count: 1,
                    max_members: 0,
                },
                GroupDescriptor {
                    id: Uuid::new_v4(),
                    name: "b".into(),
                    permanent: true,
                    isolated: true,
                    member_count: 3,
                    max_members: 4,
                },
            ],
        };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn group_state_member_count_past_boundary() {
        let p = Packet::GroupState {
            id: Uuid::new_v4(),
            name: "g".into(),
            permanent: false,
            isolated: false,
            max_members: 0,
            members: vec![Uuid::new_v4()],
        };
        let mut b = p.encode().to_vec();
        // Claim more members than the datagram holds.
        let count_off = 1 + 16 + 2 + 1 + 1 + 2;
        b[count_off..count_off + 2].copy_from_slice(&500u16.to_be_bytes());
        assert_eq!(Packet::decode(&b), Err(WireError::Malformed));
    }

    #[test]
    fn player_name_round_trip() {
        let p = Packet::PlayerName {
            player: Uuid::new_v4(),
            short: ShortId(0xCAFEBABE),
            name: "Steve".into(),
        };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn shutdown_and_disconnect_ack_round_trip() {
        assert_eq!(
            Packet::decode(&Packet::ServerShutdown.encode()).unwrap(),
            Packet::ServerShutdown
        );
        let p = Packet::DisconnectAck { reason: "server stopping".into() };
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn bad_utf8_string_is_rejected() {
        let mut b = BytesMut::new();
        b.put_u8(TYPE_DISCONNECT);
        b.put_u16(2);
        b.put_slice(&[0xFF, 0xFE]);
        assert_eq!(Packet::decode(&b), Err(WireError::BadString));
    }
}
