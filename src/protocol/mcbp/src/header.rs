// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

/// Upper bound on the frame body. A header announcing a larger body is a
/// protocol error, which keeps a bad length field from pinning a huge
/// buffer to the connection.
pub const MAX_BODY_LEN: u32 = 30 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes buffered to decode the header.
    Incomplete,
    /// The first byte is not a known magic value.
    InvalidMagic,
    /// The announced lengths are impossible (extras + key exceed the body,
    /// or the body exceeds the maximum frame size).
    InvalidLength,
}

/// A decoded request header. Decoding copies the fields out of the wire
/// representation; the body stays in the receive buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: Magic,
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self, FrameError> {
        if buffer.len() < HEADER_LEN {
            return Err(FrameError::Incomplete);
        }

        let magic = Magic::try_from(buffer[0]).map_err(|_| FrameError::InvalidMagic)?;
        if !magic.is_request() {
            return Err(FrameError::InvalidMagic);
        }

        let keylen = u16::from_be_bytes([buffer[2], buffer[3]]);
        let extlen = buffer[4];
        let bodylen = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);

        if bodylen > MAX_BODY_LEN || (extlen as u32 + keylen as u32) > bodylen {
            return Err(FrameError::InvalidLength);
        }

        Ok(Self {
            magic,
            opcode: buffer[1],
            keylen,
            extlen,
            datatype: buffer[5],
            vbucket: u16::from_be_bytes([buffer[6], buffer[7]]),
            bodylen,
            opaque: u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]),
            cas: u64::from_be_bytes([
                buffer[16], buffer[17], buffer[18], buffer[19], buffer[20], buffer[21],
                buffer[22], buffer[23],
            ]),
        })
    }

    /// Total frame length, header included.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.bodylen as usize
    }

    pub fn value_len(&self) -> usize {
        self.bodylen as usize - self.keylen as usize - self.extlen as usize
    }

    pub fn compose(&self, dst: &mut dyn BufMut) -> usize {
        dst.put_u8(self.magic as u8);
        dst.put_u8(self.opcode);
        dst.put_u16(self.keylen);
        dst.put_u8(self.extlen);
        dst.put_u8(self.datatype);
        dst.put_u16(self.vbucket);
        dst.put_u32(self.bodylen);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        HEADER_LEN
    }
}

/// A response header, composed directly into the send buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    pub magic: Magic,
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub status: Status,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self, FrameError> {
        if buffer.len() < HEADER_LEN {
            return Err(FrameError::Incomplete);
        }

        let magic = Magic::try_from(buffer[0]).map_err(|_| FrameError::InvalidMagic)?;
        if !magic.is_response() {
            return Err(FrameError::InvalidMagic);
        }

        let status = u16::from_be_bytes([buffer[6], buffer[7]]);
        let status = Status::try_from(status).map_err(|_| FrameError::InvalidLength)?;

        Ok(Self {
            magic,
            opcode: buffer[1],
            keylen: u16::from_be_bytes([buffer[2], buffer[3]]),
            extlen: buffer[4],
            datatype: buffer[5],
            status,
            bodylen: u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
            opaque: u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]),
            cas: u64::from_be_bytes([
                buffer[16], buffer[17], buffer[18], buffer[19], buffer[20], buffer[21],
                buffer[22], buffer[23],
            ]),
        })
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.bodylen as usize
    }

    pub fn compose(&self, dst: &mut dyn BufMut) -> usize {
        dst.put_u8(self.magic as u8);
        dst.put_u8(self.opcode);
        dst.put_u16(self.keylen);
        dst.put_u8(self.extlen);
        dst.put_u8(self.datatype);
        dst.put_u16(self.status as u16);
        dst.put_u32(self.bodylen);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes() -> Vec<u8> {
        let header = RequestHeader {
            magic: Magic::ClientRequest,
            opcode: Opcode::Get as u8,
            keylen: 3,
            extlen: 0,
            datatype: 0,
            vbucket: 7,
            bodylen: 3,
            opaque: 0xdead,
            cas: 0x1122334455667788,
        };
        let mut buf = Vec::new();
        header.compose(&mut buf);
        buf.extend_from_slice(b"abc");
        buf
    }

    #[test]
    fn request_round_trip() {
        let bytes = request_bytes();
        let header = RequestHeader::parse(&bytes).expect("failed to parse");

        assert_eq!(header.magic, Magic::ClientRequest);
        assert_eq!(header.opcode, Opcode::Get as u8);
        assert_eq!(header.keylen, 3);
        assert_eq!(header.bodylen, 3);
        assert_eq!(header.vbucket, 7);
        assert_eq!(header.opaque, 0xdead);
        assert_eq!(header.cas, 0x1122334455667788);
        assert_eq!(header.total_len(), bytes.len());

        let mut recomposed = Vec::new();
        header.compose(&mut recomposed);
        assert_eq!(&recomposed[..], &bytes[0..HEADER_LEN]);
    }

    #[test]
    fn parse_incomplete() {
        let bytes = request_bytes();
        for len in 0..HEADER_LEN {
            assert_eq!(
                RequestHeader::parse(&bytes[0..len]),
                Err(FrameError::Incomplete)
            );
        }
        assert!(RequestHeader::parse(&bytes[0..HEADER_LEN]).is_ok());
    }

    #[test]
    fn parse_bad_magic() {
        let mut bytes = request_bytes();
        bytes[0] = 0x42;
        assert_eq!(RequestHeader::parse(&bytes), Err(FrameError::InvalidMagic));

        // a response magic is not a valid request
        bytes[0] = Magic::ClientResponse as u8;
        assert_eq!(RequestHeader::parse(&bytes), Err(FrameError::InvalidMagic));
    }

    #[test]
    fn parse_impossible_lengths() {
        let mut bytes = request_bytes();
        // keylen larger than bodylen
        bytes[2] = 0xff;
        bytes[3] = 0xff;
        assert_eq!(RequestHeader::parse(&bytes), Err(FrameError::InvalidLength));

        let mut bytes = request_bytes();
        // bodylen above the frame size limit
        bytes[8..12].copy_from_slice(&(MAX_BODY_LEN + 1).to_be_bytes());
        assert_eq!(RequestHeader::parse(&bytes), Err(FrameError::InvalidLength));
    }

    #[test]
    fn response_round_trip() {
        let header = ResponseHeader {
            magic: Magic::ClientResponse,
            opcode: Opcode::Get as u8,
            keylen: 0,
            extlen: 4,
            datatype: 0,
            status: Status::Success,
            bodylen: 7,
            opaque: 1,
            cas: 0xdeadbeef,
        };
        let mut buf = Vec::new();
        header.compose(&mut buf);

        let parsed = ResponseHeader::parse(&buf).expect("failed to parse");
        assert_eq!(parsed, header);
    }
}
