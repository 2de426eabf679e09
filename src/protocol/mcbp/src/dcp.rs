// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Body layouts for the change-feed (DCP) commands. Collection-aware
//! channels carry one extra byte in mutation, deletion and expiration
//! extras: the length of the collection id prefixed to the key. The byte is
//! present exactly when the channel negotiated collection support; a frame
//! sized for the wrong mode is rejected.

use crate::*;

/// Flags carried in the open request.
pub const DCP_OPEN_PRODUCER: u32 = 0x01;
pub const DCP_OPEN_NOTIFIER: u32 = 0x02;
pub const DCP_OPEN_INCLUDE_XATTRS: u32 = 0x04;
pub const DCP_OPEN_NO_VALUE: u32 = 0x08;
pub const DCP_OPEN_COLLECTIONS: u32 = 0x10;
pub const DCP_OPEN_INCLUDE_DELETE_TIMES: u32 = 0x20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DcpOpen {
    pub seqno: u32,
    pub flags: u32,
}

impl DcpOpen {
    pub const EXTLEN: u8 = 8;

    pub fn decode(extras: &[u8]) -> Result<Self, FrameError> {
        if extras.len() != Self::EXTLEN as usize {
            return Err(FrameError::InvalidLength);
        }
        Ok(Self {
            seqno: u32::from_be_bytes(extras[0..4].try_into().unwrap()),
            flags: u32::from_be_bytes(extras[4..8].try_into().unwrap()),
        })
    }

    pub fn is_producer(&self) -> bool {
        self.flags & DCP_OPEN_PRODUCER != 0
    }

    pub fn is_collection_aware(&self) -> bool {
        self.flags & DCP_OPEN_COLLECTIONS != 0
    }

    pub fn include_xattrs(&self) -> bool {
        self.flags & DCP_OPEN_INCLUDE_XATTRS != 0
    }

    pub fn no_value(&self) -> bool {
        self.flags & DCP_OPEN_NO_VALUE != 0
    }

    pub fn include_delete_times(&self) -> bool {
        self.flags & DCP_OPEN_INCLUDE_DELETE_TIMES != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DcpMutation {
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiration: u32,
    pub lock_time: u32,
    pub nmeta: u16,
    pub nru: u8,
    /// Length of the collection id prefixed to the key; zero means the
    /// default collection. Only on collection-aware channels.
    pub collection_len: u8,
}

impl DcpMutation {
    pub fn extlen(collection_aware: bool) -> u8 {
        if collection_aware {
            32
        } else {
            31
        }
    }

    pub fn decode(extras: &[u8], collection_aware: bool) -> Result<Self, FrameError> {
        if extras.len() != Self::extlen(collection_aware) as usize {
            return Err(FrameError::InvalidLength);
        }
        Ok(Self {
            by_seqno: u64::from_be_bytes(extras[0..8].try_into().unwrap()),
            rev_seqno: u64::from_be_bytes(extras[8..16].try_into().unwrap()),
            flags: u32::from_be_bytes(extras[16..20].try_into().unwrap()),
            expiration: u32::from_be_bytes(extras[20..24].try_into().unwrap()),
            lock_time: u32::from_be_bytes(extras[24..28].try_into().unwrap()),
            nmeta: u16::from_be_bytes(extras[28..30].try_into().unwrap()),
            nru: extras[30],
            collection_len: if collection_aware { extras[31] } else { 0 },
        })
    }

    pub fn compose_extras(&self, dst: &mut dyn BufMut, collection_aware: bool) -> usize {
        dst.put_u64(self.by_seqno);
        dst.put_u64(self.rev_seqno);
        dst.put_u32(self.flags);
        dst.put_u32(self.expiration);
        dst.put_u32(self.lock_time);
        dst.put_u16(self.nmeta);
        dst.put_u8(self.nru);
        if collection_aware {
            dst.put_u8(self.collection_len);
        }
        Self::extlen(collection_aware) as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DcpDeletion {
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub nmeta: u16,
    /// See [`DcpMutation::collection_len`].
    pub collection_len: u8,
}

impl DcpDeletion {
    pub fn extlen(collection_aware: bool) -> u8 {
        if collection_aware {
            19
        } else {
            18
        }
    }

    pub fn decode(extras: &[u8], collection_aware: bool) -> Result<Self, FrameError> {
        if extras.len() != Self::extlen(collection_aware) as usize {
            return Err(FrameError::InvalidLength);
        }
        Ok(Self {
            by_seqno: u64::from_be_bytes(extras[0..8].try_into().unwrap()),
            rev_seqno: u64::from_be_bytes(extras[8..16].try_into().unwrap()),
            nmeta: u16::from_be_bytes(extras[16..18].try_into().unwrap()),
            collection_len: if collection_aware { extras[18] } else { 0 },
        })
    }

    pub fn compose_extras(&self, dst: &mut dyn BufMut, collection_aware: bool) -> usize {
        dst.put_u64(self.by_seqno);
        dst.put_u64(self.rev_seqno);
        dst.put_u16(self.nmeta);
        if collection_aware {
            dst.put_u8(self.collection_len);
        }
        Self::extlen(collection_aware) as usize
    }
}

/// Expirations share the deletion body layout.
pub type DcpExpiration = DcpDeletion;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DcpSnapshotMarker {
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl DcpSnapshotMarker {
    pub const EXTLEN: u8 = 20;

    pub fn decode(extras: &[u8]) -> Result<Self, FrameError> {
        if extras.len() != Self::EXTLEN as usize {
            return Err(FrameError::InvalidLength);
        }
        Ok(Self {
            start_seqno: u64::from_be_bytes(extras[0..8].try_into().unwrap()),
            end_seqno: u64::from_be_bytes(extras[8..16].try_into().unwrap()),
            flags: u32::from_be_bytes(extras[16..20].try_into().unwrap()),
        })
    }

    pub fn compose_extras(&self, dst: &mut dyn BufMut) -> usize {
        dst.put_u64(self.start_seqno);
        dst.put_u64(self.end_seqno);
        dst.put_u32(self.flags);
        Self::EXTLEN as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DcpStreamEnd {
    pub flags: u32,
}

impl DcpStreamEnd {
    pub const EXTLEN: u8 = 4;

    pub fn decode(extras: &[u8]) -> Result<Self, FrameError> {
        if extras.len() != Self::EXTLEN as usize {
            return Err(FrameError::InvalidLength);
        }
        Ok(Self {
            flags: u32::from_be_bytes(extras[0..4].try_into().unwrap()),
        })
    }

    pub fn compose_extras(&self, dst: &mut dyn BufMut) -> usize {
        dst.put_u32(self.flags);
        Self::EXTLEN as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DcpBufferAcknowledgement {
    pub buffer_bytes: u32,
}

impl DcpBufferAcknowledgement {
    pub const EXTLEN: u8 = 4;

    pub fn decode(extras: &[u8]) -> Result<Self, FrameError> {
        if extras.len() != Self::EXTLEN as usize {
            return Err(FrameError::InvalidLength);
        }
        Ok(Self {
            buffer_bytes: u32::from_be_bytes(extras[0..4].try_into().unwrap()),
        })
    }
}

/// Encode a failover log (vbucket uuid, seqno pairs) as a response value.
pub fn compose_failover_log(log: &[(u64, u64)], dst: &mut dyn BufMut) -> usize {
    for (uuid, seqno) in log {
        dst.put_u64(*uuid);
        dst.put_u64(*seqno);
    }
    log.len() * 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_round_trip() {
        let body = DcpDeletion {
            by_seqno: 42,
            rev_seqno: 7,
            nmeta: 0,
            collection_len: 1,
        };

        for aware in [false, true] {
            let mut buf = Vec::new();
            body.compose_extras(&mut buf, aware);
            assert_eq!(buf.len(), DcpDeletion::extlen(aware) as usize);

            let decoded = DcpDeletion::decode(&buf, aware).expect("failed to decode");
            assert_eq!(decoded.by_seqno, 42);
            assert_eq!(decoded.rev_seqno, 7);
            assert_eq!(decoded.collection_len, if aware { 1 } else { 0 });
        }
    }

    #[test]
    fn deletion_wrong_mode_rejected() {
        let body = DcpDeletion {
            by_seqno: 1,
            rev_seqno: 1,
            nmeta: 0,
            collection_len: 0,
        };

        // collection-aware extras presented to a plain channel, and the
        // reverse, both fail the length check
        let mut buf = Vec::new();
        body.compose_extras(&mut buf, true);
        assert!(DcpDeletion::decode(&buf, false).is_err());

        let mut buf = Vec::new();
        body.compose_extras(&mut buf, false);
        assert!(DcpDeletion::decode(&buf, true).is_err());
    }

    #[test]
    fn mutation_round_trip() {
        let body = DcpMutation {
            by_seqno: 9,
            rev_seqno: 3,
            flags: 0x12345678,
            expiration: 60,
            lock_time: 0,
            nmeta: 0,
            nru: 2,
            collection_len: 0,
        };

        let mut buf = Vec::new();
        body.compose_extras(&mut buf, true);
        let decoded = DcpMutation::decode(&buf, true).expect("failed to decode");
        assert_eq!(decoded, body);
    }

    #[test]
    fn open_flags() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&(DCP_OPEN_PRODUCER | DCP_OPEN_COLLECTIONS).to_be_bytes());

        let open = DcpOpen::decode(&buf).expect("failed to decode");
        assert!(open.is_producer());
        assert!(open.is_collection_aware());
        assert!(!open.no_value());
    }

    #[test]
    fn failover_log_encoding() {
        let mut buf = Vec::new();
        let len = compose_failover_log(&[(0x1111, 1), (0x2222, 2)], &mut buf);
        assert_eq!(len, 32);
        assert_eq!(&buf[0..8], &0x1111u64.to_be_bytes());
        assert_eq!(&buf[24..32], &2u64.to_be_bytes());
    }
}
