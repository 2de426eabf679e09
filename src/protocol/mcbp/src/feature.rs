// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Feature identifiers negotiated through the hello command. Each entry in
/// the request value is a 16 bit identifier in network byte order; the
/// response value lists the subset the server enabled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Feature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNoDelay = 0x03,
    MutationSeqno = 0x04,
    TcpDelay = 0x05,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Collections = 0x09,
    Snappy = 0x0a,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
}

impl TryFrom<u16> for Feature {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        match value {
            0x01 => Ok(Feature::Datatype),
            0x02 => Ok(Feature::Tls),
            0x03 => Ok(Feature::TcpNoDelay),
            0x04 => Ok(Feature::MutationSeqno),
            0x05 => Ok(Feature::TcpDelay),
            0x06 => Ok(Feature::Xattr),
            0x07 => Ok(Feature::Xerror),
            0x08 => Ok(Feature::SelectBucket),
            0x09 => Ok(Feature::Collections),
            0x0a => Ok(Feature::Snappy),
            0x0b => Ok(Feature::Json),
            0x0c => Ok(Feature::Duplex),
            0x0d => Ok(Feature::ClustermapChangeNotification),
            0x0e => Ok(Feature::UnorderedExecution),
            0x0f => Ok(Feature::Tracing),
            _ => Err(()),
        }
    }
}
