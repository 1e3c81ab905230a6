//! Wire encoding for Raft messages exchanged between peers, plus an optional higher-level
//! envelope header used to validate frames before they reach the Raft engine.

use bytes::Bytes;
use prost::Message as ProstMessage;

use raft::message::Message;

use crate::error::{Error, Result};

pub const ENVELOPE_MAGIC: u32 = 0x5047_5241; // "PGRA"
pub const ENVELOPE_VERSION: u32 = 1;

/// Header fields for the higher-level envelope. Carried alongside the Raft payload
/// when a consumer needs to validate a frame before attempting to decode it as a Raft message
/// (e.g. distinguishing stray non-Raft connections on the same port range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub magic: u32,
    pub version: u32,
    pub msg_type: u8,
    pub msg_size: u32,
    pub from_node: u32,
    pub to_node: u32,
    pub term: u64,
    pub index: u64,
    pub timestamp: u64,
    pub checksum: u32,
}

pub const MSG_TYPE_RAFT: u8 = 1;

impl EnvelopeHeader {
    pub fn validate(&self) -> Result<()> {
        if self.magic != ENVELOPE_MAGIC {
            return Err(Error::InvalidParameter("bad envelope magic".to_string()));
        }
        if self.version != ENVELOPE_VERSION {
            return Err(Error::InvalidParameter("unsupported envelope version".to_string()));
        }
        if self.msg_type != MSG_TYPE_RAFT {
            return Err(Error::InvalidParameter("unknown msg_type".to_string()));
        }
        Ok(())
    }
}

/// Encodes a Raft protocol message to its binary wire form.
pub fn encode_message(msg: &Message) -> Bytes {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).expect("encode raft message");
    Bytes::from(buf)
}

/// Decodes a Raft protocol message from its binary wire form.
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    Message::decode(bytes).map_err(|e| Error::InvalidParameter(format!("bad raft frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::message::{Rpc, TermId, VoteRequest, LogIndex};

    #[test]
    fn roundtrips_a_vote_request() {
        let msg = Message {
            term: TermId { id: 7 },
            rpc: Some(Rpc::VoteRequest(VoteRequest {
                last_log_idx: LogIndex { id: 3 },
                last_log_term: TermId { id: 6 },
            })),
        };
        let encoded = encode_message(&msg);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.term.id, 7);
        assert!(matches!(decoded.rpc, Some(Rpc::VoteRequest(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let header = EnvelopeHeader {
            magic: 0,
            version: ENVELOPE_VERSION,
            msg_type: MSG_TYPE_RAFT,
            msg_size: 0,
            from_node: 1,
            to_node: 2,
            term: 0,
            index: 0,
            timestamp: 0,
            checksum: 0,
        };
        assert!(header.validate().is_err());
    }
}
