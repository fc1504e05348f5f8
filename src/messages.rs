//! # Wire Protocol Messages
//!
//! Every frame starts with a one-byte discriminator ([`MessageKind`]).
//! Control frames follow it with the 32-byte channel key; data frames carry a
//! 32-byte message id instead, from which the receiver recovers the channel:
//!
//! ```text
//! control: [kind:1][channel_key:32][fields...]
//! data:    [kind:1][msg_id:32][origin_ts_ms:8][payload...]
//! msg_id:  ["FNT1":4][seq:4][channel key suffix:24]
//! ```
//!
//! ## Field encodings
//!
//! | Field | Encoding |
//! |-------|----------|
//! | integers | big-endian |
//! | bid per byte | `f64` bit pattern (finite, non-negative) |
//! | identity | `[len:1][bytes]`, len must be 32 |
//! | address blob | `[len:2][bytes]` |
//! | lists | `[count:1]` followed by entries (max 255) |
//! | routes | `[hops:1]` followed by identities (max 32) |
//!
//! Decoding is total: any malformed input yields a [`DecodeError`] and the
//! node drops the frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RejectReason;
use crate::identity::Identity;

pub type ChannelKey = [u8; 32];

pub type MessageId = [u8; 32];

pub const MESSAGE_ID_PREFIX: [u8; 4] = *b"FNT1";

pub const KEY_SUFFIX_LEN: usize = 24;

pub const MAX_ROUTE_HOPS: usize = 32;

pub const MAX_LIST_ENTRIES: usize = 255;

pub const MAX_REDIRECTS: usize = 4;

pub const MAX_ADDR_LEN: usize = u16::MAX as usize;

/// Fixed bytes in a data frame ahead of the payload.
pub const DATA_HEADER_LEN: usize = 1 + 32 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("invalid identity length {0}")]
    InvalidIdentityLength(u8),
    #[error("route exceeds {MAX_ROUTE_HOPS} hops")]
    RouteTooLong,
    #[error("invalid field value: {0}")]
    InvalidValue(&'static str),
    #[error("trailing bytes after message")]
    TrailingBytes,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    JoinReq = 0x01,
    JoinAccept = 0x02,
    JoinReject = 0x03,
    Kick = 0x04,
    Leave = 0x05,
    Data = 0x10,
    End = 0x11,
    ProxyPublish = 0x12,
    RepairReq = 0x13,
    FetchReq = 0x14,
    IHave = 0x15,
    TrackerAnnounce = 0x20,
    TrackerQuery = 0x21,
    TrackerReply = 0x22,
    TrackerFeedback = 0x23,
    ProviderAnnounce = 0x28,
    ProviderQuery = 0x29,
    ProviderReply = 0x2A,
    RouteQuery = 0x30,
    RouteReply = 0x31,
    Unicast = 0x38,
    UnicastAck = 0x39,
    UnicastAckReply = 0x3A,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        use MessageKind::*;
        Some(match b {
            0x01 => JoinReq,
            0x02 => JoinAccept,
            0x03 => JoinReject,
            0x04 => Kick,
            0x05 => Leave,
            0x10 => Data,
            0x11 => End,
            0x12 => ProxyPublish,
            0x13 => RepairReq,
            0x14 => FetchReq,
            0x15 => IHave,
            0x20 => TrackerAnnounce,
            0x21 => TrackerQuery,
            0x22 => TrackerReply,
            0x23 => TrackerFeedback,
            0x28 => ProviderAnnounce,
            0x29 => ProviderQuery,
            0x2A => ProviderReply,
            0x30 => RouteQuery,
            0x31 => RouteReply,
            0x38 => Unicast,
            0x39 => UnicastAck,
            0x3A => UnicastAckReply,
            _ => return None,
        })
    }

    /// Control traffic jumps ahead of data on transports that prioritize.
    pub fn priority(self) -> Priority {
        match self {
            MessageKind::Data | MessageKind::ProxyPublish | MessageKind::Unicast => Priority::Low,
            _ => Priority::High,
        }
    }
}

/// Why a parent dropped a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KickReason {
    Outbid,
    Overload,
    WriteFailure,
    ParentLost,
    Closing,
}

impl KickReason {
    fn to_byte(self) -> u8 {
        match self {
            KickReason::Outbid => 1,
            KickReason::Overload => 2,
            KickReason::WriteFailure => 3,
            KickReason::ParentLost => 4,
            KickReason::Closing => 5,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(KickReason::Outbid),
            2 => Some(KickReason::Overload),
            3 => Some(KickReason::WriteFailure),
            4 => Some(KickReason::ParentLost),
            5 => Some(KickReason::Closing),
            _ => None,
        }
    }
}

/// Join outcome reported back to the tracker that suggested a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackEvent {
    Joined,
    DialFailed,
    JoinTimeout,
    JoinReject(RejectReason),
}

/// A peer with the addresses it can be dialed at.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAddrs {
    pub peer: Identity,
    pub addrs: Vec<Vec<u8>>,
}

/// One tracker entry as it travels in `TRACKER_REPLY`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerRecord {
    pub peer: Identity,
    pub level: u16,
    pub free_slots: u16,
    pub bid_per_byte: f64,
    pub addrs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    JoinReq {
        key: ChannelKey,
        req_id: u32,
        bid_per_byte: f64,
        addrs: Vec<Vec<u8>>,
    },
    JoinAccept {
        key: ChannelKey,
        req_id: u32,
        level: u16,
        route: Vec<Identity>,
    },
    JoinReject {
        key: ChannelKey,
        req_id: u32,
        reason: RejectReason,
        redirects: Vec<PeerAddrs>,
    },
    Kick {
        key: ChannelKey,
        reason: KickReason,
    },
    Leave {
        key: ChannelKey,
    },
    Data {
        msg_id: MessageId,
        origin_ts: u64,
        payload: Vec<u8>,
    },
    End {
        key: ChannelKey,
        end_seq_exclusive: u32,
    },
    ProxyPublish {
        key: ChannelKey,
        payload: Vec<u8>,
    },
    RepairReq {
        key: ChannelKey,
        seqs: Vec<u32>,
    },
    FetchReq {
        key: ChannelKey,
        seqs: Vec<u32>,
    },
    IHave {
        key: ChannelKey,
        have_from: u32,
        have_to_exclusive: u32,
    },
    TrackerAnnounce {
        key: ChannelKey,
        ttl_secs: u16,
        level: u16,
        max_children: u16,
        free_slots: u16,
        bid_per_byte: f64,
        addrs: Vec<Vec<u8>>,
    },
    TrackerQuery {
        key: ChannelKey,
        req_id: u32,
        want: u8,
    },
    TrackerReply {
        key: ChannelKey,
        req_id: u32,
        entries: Vec<TrackerRecord>,
    },
    TrackerFeedback {
        key: ChannelKey,
        candidate: Identity,
        event: FeedbackEvent,
    },
    ProviderAnnounce {
        key: ChannelKey,
        ttl_secs: u16,
        addrs: Vec<Vec<u8>>,
    },
    ProviderQuery {
        key: ChannelKey,
        req_id: u32,
        want: u8,
    },
    ProviderReply {
        key: ChannelKey,
        req_id: u32,
        entries: Vec<PeerAddrs>,
    },
    RouteQuery {
        key: ChannelKey,
        req_id: u32,
        target: Identity,
    },
    RouteReply {
        key: ChannelKey,
        req_id: u32,
        route: Option<Vec<Identity>>,
    },
    Unicast {
        key: ChannelKey,
        route: Vec<Identity>,
        payload: Vec<u8>,
    },
    UnicastAck {
        key: ChannelKey,
        token: u64,
        route: Vec<Identity>,
        reply_route: Vec<Identity>,
        payload: Vec<u8>,
    },
    UnicastAckReply {
        key: ChannelKey,
        token: u64,
        route: Vec<Identity>,
    },
}

/// Build the 32-byte id of a data message.
pub fn message_id(seq: u32, suffix: &[u8; KEY_SUFFIX_LEN]) -> MessageId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&MESSAGE_ID_PREFIX);
    id[4..8].copy_from_slice(&seq.to_be_bytes());
    id[8..].copy_from_slice(suffix);
    id
}

/// Split a message id into sequence number and channel key suffix.
pub fn parse_message_id(id: &MessageId) -> Option<(u32, [u8; KEY_SUFFIX_LEN])> {
    if id[..4] != MESSAGE_ID_PREFIX {
        return None;
    }
    let seq = u32::from_be_bytes([id[4], id[5], id[6], id[7]]);
    let mut suffix = [0u8; KEY_SUFFIX_LEN];
    suffix.copy_from_slice(&id[8..]);
    Some((seq, suffix))
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::JoinReq { .. } => MessageKind::JoinReq,
            Message::JoinAccept { .. } => MessageKind::JoinAccept,
            Message::JoinReject { .. } => MessageKind::JoinReject,
            Message::Kick { .. } => MessageKind::Kick,
            Message::Leave { .. } => MessageKind::Leave,
            Message::Data { .. } => MessageKind::Data,
            Message::End { .. } => MessageKind::End,
            Message::ProxyPublish { .. } => MessageKind::ProxyPublish,
            Message::RepairReq { .. } => MessageKind::RepairReq,
            Message::FetchReq { .. } => MessageKind::FetchReq,
            Message::IHave { .. } => MessageKind::IHave,
            Message::TrackerAnnounce { .. } => MessageKind::TrackerAnnounce,
            Message::TrackerQuery { .. } => MessageKind::TrackerQuery,
            Message::TrackerReply { .. } => MessageKind::TrackerReply,
            Message::TrackerFeedback { .. } => MessageKind::TrackerFeedback,
            Message::ProviderAnnounce { .. } => MessageKind::ProviderAnnounce,
            Message::ProviderQuery { .. } => MessageKind::ProviderQuery,
            Message::ProviderReply { .. } => MessageKind::ProviderReply,
            Message::RouteQuery { .. } => MessageKind::RouteQuery,
            Message::RouteReply { .. } => MessageKind::RouteReply,
            Message::Unicast { .. } => MessageKind::Unicast,
            Message::UnicastAck { .. } => MessageKind::UnicastAck,
            Message::UnicastAckReply { .. } => MessageKind::UnicastAckReply,
        }
    }

    /// Channel (or namespace) key of a control frame. Data frames carry
    /// only the key suffix inside their message id.
    pub fn channel_key(&self) -> Option<&ChannelKey> {
        match self {
            Message::Data { .. } => None,
            Message::JoinReq { key, .. }
            | Message::JoinAccept { key, .. }
            | Message::JoinReject { key, .. }
            | Message::Kick { key, .. }
            | Message::Leave { key }
            | Message::End { key, .. }
            | Message::ProxyPublish { key, .. }
            | Message::RepairReq { key, .. }
            | Message::FetchReq { key, .. }
            | Message::IHave { key, .. }
            | Message::TrackerAnnounce { key, .. }
            | Message::TrackerQuery { key, .. }
            | Message::TrackerReply { key, .. }
            | Message::TrackerFeedback { key, .. }
            | Message::ProviderAnnounce { key, .. }
            | Message::ProviderQuery { key, .. }
            | Message::ProviderReply { key, .. }
            | Message::RouteQuery { key, .. }
            | Message::RouteReply { key, .. }
            | Message::Unicast { key, .. }
            | Message::UnicastAck { key, .. }
            | Message::UnicastAckReply { key, .. } => Some(key),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = match self {
            Message::Data { payload, .. } => Writer::with_capacity(DATA_HEADER_LEN + payload.len()),
            _ => Writer::with_capacity(64),
        };
        w.put_u8(self.kind() as u8);
        match self {
            Message::JoinReq { key, req_id, bid_per_byte, addrs } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                w.put_f64(*bid_per_byte);
                w.put_addrs(addrs);
            }
            Message::JoinAccept { key, req_id, level, route } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                w.put_u16(*level);
                w.put_route(route);
            }
            Message::JoinReject { key, req_id, reason, redirects } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                w.put_u8(reason.to_byte());
                let redirects = &redirects[..redirects.len().min(MAX_REDIRECTS)];
                w.put_u8(redirects.len() as u8);
                for r in redirects {
                    w.put_identity(&r.peer);
                    w.put_addrs(&r.addrs);
                }
            }
            Message::Kick { key, reason } => {
                w.put_bytes(key);
                w.put_u8(reason.to_byte());
            }
            Message::Leave { key } => {
                w.put_bytes(key);
            }
            Message::Data { msg_id, origin_ts, payload } => {
                w.put_bytes(msg_id);
                w.put_u64(*origin_ts);
                w.put_bytes(payload);
            }
            Message::End { key, end_seq_exclusive } => {
                w.put_bytes(key);
                w.put_u32(*end_seq_exclusive);
            }
            Message::ProxyPublish { key, payload } => {
                w.put_bytes(key);
                w.put_bytes(payload);
            }
            Message::RepairReq { key, seqs } | Message::FetchReq { key, seqs } => {
                w.put_bytes(key);
                w.put_seqs(seqs);
            }
            Message::IHave { key, have_from, have_to_exclusive } => {
                w.put_bytes(key);
                w.put_u32(*have_from);
                w.put_u32(*have_to_exclusive);
            }
            Message::TrackerAnnounce {
                key,
                ttl_secs,
                level,
                max_children,
                free_slots,
                bid_per_byte,
                addrs,
            } => {
                w.put_bytes(key);
                w.put_u16(*ttl_secs);
                w.put_u16(*level);
                w.put_u16(*max_children);
                w.put_u16(*free_slots);
                w.put_f64(*bid_per_byte);
                w.put_addrs(addrs);
            }
            Message::TrackerQuery { key, req_id, want }
            | Message::ProviderQuery { key, req_id, want } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                w.put_u8(*want);
            }
            Message::TrackerReply { key, req_id, entries } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                let entries = &entries[..entries.len().min(MAX_LIST_ENTRIES)];
                w.put_u8(entries.len() as u8);
                for e in entries {
                    w.put_identity(&e.peer);
                    w.put_u16(e.level);
                    w.put_u16(e.free_slots);
                    w.put_f64(e.bid_per_byte);
                    w.put_addrs(&e.addrs);
                }
            }
            Message::TrackerFeedback { key, candidate, event } => {
                w.put_bytes(key);
                w.put_identity(candidate);
                let (code, reason) = match event {
                    FeedbackEvent::Joined => (1, 0),
                    FeedbackEvent::DialFailed => (2, 0),
                    FeedbackEvent::JoinTimeout => (3, 0),
                    FeedbackEvent::JoinReject(r) => (4, r.to_byte()),
                };
                w.put_u8(code);
                w.put_u8(reason);
            }
            Message::ProviderAnnounce { key, ttl_secs, addrs } => {
                w.put_bytes(key);
                w.put_u16(*ttl_secs);
                w.put_addrs(addrs);
            }
            Message::ProviderReply { key, req_id, entries } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                let entries = &entries[..entries.len().min(MAX_LIST_ENTRIES)];
                w.put_u8(entries.len() as u8);
                for e in entries {
                    w.put_identity(&e.peer);
                    w.put_addrs(&e.addrs);
                }
            }
            Message::RouteQuery { key, req_id, target } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                w.put_identity(target);
            }
            Message::RouteReply { key, req_id, route } => {
                w.put_bytes(key);
                w.put_u32(*req_id);
                match route {
                    Some(route) => {
                        w.put_u8(1);
                        w.put_route(route);
                    }
                    None => w.put_u8(0),
                }
            }
            Message::Unicast { key, route, payload } => {
                w.put_bytes(key);
                w.put_route(route);
                w.put_bytes(payload);
            }
            Message::UnicastAck { key, token, route, reply_route, payload } => {
                w.put_bytes(key);
                w.put_u64(*token);
                w.put_route(route);
                w.put_route(reply_route);
                w.put_bytes(payload);
            }
            Message::UnicastAckReply { key, token, route } => {
                w.put_bytes(key);
                w.put_u64(*token);
                w.put_route(route);
            }
        }
        w.into_inner()
    }

    pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
        let mut r = Reader::new(frame);
        let kind_byte = r.u8()?;
        let kind = MessageKind::from_byte(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;

        if kind == MessageKind::Data {
            let msg_id = r.array32()?;
            let origin_ts = r.u64()?;
            let payload = r.rest().to_vec();
            return Ok(Message::Data { msg_id, origin_ts, payload });
        }

        let key = r.array32()?;
        let msg = match kind {
            MessageKind::JoinReq => Message::JoinReq {
                key,
                req_id: r.u32()?,
                bid_per_byte: r.bid()?,
                addrs: r.addrs()?,
            },
            MessageKind::JoinAccept => Message::JoinAccept {
                key,
                req_id: r.u32()?,
                level: r.u16()?,
                route: r.route()?,
            },
            MessageKind::JoinReject => {
                let req_id = r.u32()?;
                let reason = RejectReason::from_byte(r.u8()?)
                    .ok_or(DecodeError::InvalidValue("reject reason"))?;
                let count = r.u8()? as usize;
                if count > MAX_REDIRECTS {
                    return Err(DecodeError::InvalidValue("redirect count"));
                }
                let mut redirects = Vec::with_capacity(count);
                for _ in 0..count {
                    redirects.push(PeerAddrs { peer: r.identity()?, addrs: r.addrs()? });
                }
                Message::JoinReject { key, req_id, reason, redirects }
            }
            MessageKind::Kick => Message::Kick {
                key,
                reason: KickReason::from_byte(r.u8()?)
                    .ok_or(DecodeError::InvalidValue("kick reason"))?,
            },
            MessageKind::Leave => Message::Leave { key },
            MessageKind::End => Message::End { key, end_seq_exclusive: r.u32()? },
            MessageKind::ProxyPublish => {
                return Ok(Message::ProxyPublish { key, payload: r.rest().to_vec() });
            }
            MessageKind::RepairReq => Message::RepairReq { key, seqs: r.seqs()? },
            MessageKind::FetchReq => Message::FetchReq { key, seqs: r.seqs()? },
            MessageKind::IHave => {
                let have_from = r.u32()?;
                let have_to_exclusive = r.u32()?;
                if have_to_exclusive < have_from {
                    return Err(DecodeError::InvalidValue("ihave range"));
                }
                Message::IHave { key, have_from, have_to_exclusive }
            }
            MessageKind::TrackerAnnounce => Message::TrackerAnnounce {
                key,
                ttl_secs: r.u16()?,
                level: r.u16()?,
                max_children: r.u16()?,
                free_slots: r.u16()?,
                bid_per_byte: r.bid()?,
                addrs: r.addrs()?,
            },
            MessageKind::TrackerQuery => Message::TrackerQuery { key, req_id: r.u32()?, want: r.u8()? },
            MessageKind::TrackerReply => {
                let req_id = r.u32()?;
                let count = r.u8()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(TrackerRecord {
                        peer: r.identity()?,
                        level: r.u16()?,
                        free_slots: r.u16()?,
                        bid_per_byte: r.bid()?,
                        addrs: r.addrs()?,
                    });
                }
                Message::TrackerReply { key, req_id, entries }
            }
            MessageKind::TrackerFeedback => {
                let candidate = r.identity()?;
                let code = r.u8()?;
                let reason = r.u8()?;
                let event = match code {
                    1 => FeedbackEvent::Joined,
                    2 => FeedbackEvent::DialFailed,
                    3 => FeedbackEvent::JoinTimeout,
                    4 => FeedbackEvent::JoinReject(
                        RejectReason::from_byte(reason)
                            .ok_or(DecodeError::InvalidValue("feedback reason"))?,
                    ),
                    _ => return Err(DecodeError::InvalidValue("feedback event")),
                };
                Message::TrackerFeedback { key, candidate, event }
            }
            MessageKind::ProviderAnnounce => Message::ProviderAnnounce {
                key,
                ttl_secs: r.u16()?,
                addrs: r.addrs()?,
            },
            MessageKind::ProviderQuery => Message::ProviderQuery { key, req_id: r.u32()?, want: r.u8()? },
            MessageKind::ProviderReply => {
                let req_id = r.u32()?;
                let count = r.u8()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(PeerAddrs { peer: r.identity()?, addrs: r.addrs()? });
                }
                Message::ProviderReply { key, req_id, entries }
            }
            MessageKind::RouteQuery => Message::RouteQuery {
                key,
                req_id: r.u32()?,
                target: r.identity()?,
            },
            MessageKind::RouteReply => {
                let req_id = r.u32()?;
                let route = match r.u8()? {
                    0 => None,
                    1 => Some(r.route()?),
                    _ => return Err(DecodeError::InvalidValue("route flag")),
                };
                Message::RouteReply { key, req_id, route }
            }
            MessageKind::Unicast => {
                let route = r.route()?;
                return Ok(Message::Unicast { key, route, payload: r.rest().to_vec() });
            }
            MessageKind::UnicastAck => {
                let token = r.u64()?;
                let route = r.route()?;
                let reply_route = r.route()?;
                return Ok(Message::UnicastAck {
                    key,
                    token,
                    route,
                    reply_route,
                    payload: r.rest().to_vec(),
                });
            }
            MessageKind::UnicastAckReply => Message::UnicastAckReply {
                key,
                token: r.u64()?,
                route: r.route()?,
            },
            MessageKind::Data => unreachable!("data frames are decoded above"),
        };

        if !r.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(msg)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn put_identity(&mut self, id: &Identity) {
        self.put_u8(Identity::LEN as u8);
        self.put_bytes(id.as_bytes());
    }

    fn put_addrs(&mut self, addrs: &[Vec<u8>]) {
        let addrs: Vec<&Vec<u8>> = addrs
            .iter()
            .filter(|a| a.len() <= MAX_ADDR_LEN)
            .take(MAX_LIST_ENTRIES)
            .collect();
        self.put_u8(addrs.len() as u8);
        for addr in addrs {
            self.put_u16(addr.len() as u16);
            self.put_bytes(addr);
        }
    }

    fn put_route(&mut self, route: &[Identity]) {
        let route = &route[..route.len().min(MAX_ROUTE_HOPS)];
        self.put_u8(route.len() as u8);
        for hop in route {
            self.put_identity(hop);
        }
    }

    fn put_seqs(&mut self, seqs: &[u32]) {
        let seqs = &seqs[..seqs.len().min(MAX_LIST_ENTRIES)];
        self.put_u8(seqs.len() as u8);
        for s in seqs {
            self.put_u32(*s);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len().saturating_sub(self.pos) < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        slice
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn bid(&mut self) -> Result<f64, DecodeError> {
        let v = f64::from_bits(self.u64()?);
        if !v.is_finite() || v < 0.0 {
            return Err(DecodeError::InvalidValue("bid per byte"));
        }
        Ok(v)
    }

    fn array32(&mut self) -> Result<[u8; 32], DecodeError> {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(self.take(32)?);
        Ok(arr)
    }

    fn identity(&mut self) -> Result<Identity, DecodeError> {
        let len = self.u8()?;
        if len as usize != Identity::LEN {
            return Err(DecodeError::InvalidIdentityLength(len));
        }
        Ok(Identity::from_bytes(self.array32()?))
    }

    fn addrs(&mut self) -> Result<Vec<Vec<u8>>, DecodeError> {
        let count = self.u8()? as usize;
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self.u16()? as usize;
            addrs.push(self.take(len)?.to_vec());
        }
        Ok(addrs)
    }

    fn route(&mut self) -> Result<Vec<Identity>, DecodeError> {
        let hops = self.u8()? as usize;
        if hops > MAX_ROUTE_HOPS {
            return Err(DecodeError::RouteTooLong);
        }
        let mut route = Vec::with_capacity(hops);
        for _ in 0..hops {
            route.push(self.identity()?);
        }
        Ok(route)
    }

    fn seqs(&mut self) -> Result<Vec<u32>, DecodeError> {
        let count = self.u8()? as usize;
        let mut seqs = Vec::with_capacity(count);
        for _ in 0..count {
            seqs.push(self.u32()?);
        }
        Ok(seqs)
    }
}
