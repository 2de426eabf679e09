// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// One-byte command identifiers. Unlisted values dispatch to the selected
/// engine's unknown-command hook.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    Verbosity = 0x1b,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    DcpOpen = 0x50,
    DcpAddStream = 0x51,
    DcpCloseStream = 0x52,
    DcpStreamReq = 0x53,
    DcpGetFailoverLog = 0x54,
    DcpStreamEnd = 0x55,
    DcpSnapshotMarker = 0x56,
    DcpMutation = 0x57,
    DcpDeletion = 0x58,
    DcpExpiration = 0x59,
    DcpNoop = 0x5c,
    DcpBufferAcknowledgement = 0x5d,
    DcpControl = 0x5e,
    SelectBucket = 0x89,
    GetLocked = 0x94,
    UnlockKey = 0x95,
}

impl Opcode {
    /// Quiet variants suppress the response on miss (for gets) or on
    /// success (for mutations).
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
        )
    }

    pub fn is_dcp(&self) -> bool {
        (0x50..=0x5e).contains(&(*self as u8))
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(Opcode::Get),
            0x01 => Ok(Opcode::Set),
            0x02 => Ok(Opcode::Add),
            0x03 => Ok(Opcode::Replace),
            0x04 => Ok(Opcode::Delete),
            0x05 => Ok(Opcode::Increment),
            0x06 => Ok(Opcode::Decrement),
            0x07 => Ok(Opcode::Quit),
            0x08 => Ok(Opcode::Flush),
            0x09 => Ok(Opcode::GetQ),
            0x0a => Ok(Opcode::Noop),
            0x0b => Ok(Opcode::Version),
            0x0c => Ok(Opcode::GetK),
            0x0d => Ok(Opcode::GetKQ),
            0x0e => Ok(Opcode::Append),
            0x0f => Ok(Opcode::Prepend),
            0x10 => Ok(Opcode::Stat),
            0x11 => Ok(Opcode::SetQ),
            0x12 => Ok(Opcode::AddQ),
            0x13 => Ok(Opcode::ReplaceQ),
            0x14 => Ok(Opcode::DeleteQ),
            0x1b => Ok(Opcode::Verbosity),
            0x1f => Ok(Opcode::Hello),
            0x20 => Ok(Opcode::SaslListMechs),
            0x21 => Ok(Opcode::SaslAuth),
            0x22 => Ok(Opcode::SaslStep),
            0x50 => Ok(Opcode::DcpOpen),
            0x51 => Ok(Opcode::DcpAddStream),
            0x52 => Ok(Opcode::DcpCloseStream),
            0x53 => Ok(Opcode::DcpStreamReq),
            0x54 => Ok(Opcode::DcpGetFailoverLog),
            0x55 => Ok(Opcode::DcpStreamEnd),
            0x56 => Ok(Opcode::DcpSnapshotMarker),
            0x57 => Ok(Opcode::DcpMutation),
            0x58 => Ok(Opcode::DcpDeletion),
            0x59 => Ok(Opcode::DcpExpiration),
            0x5c => Ok(Opcode::DcpNoop),
            0x5d => Ok(Opcode::DcpBufferAcknowledgement),
            0x5e => Ok(Opcode::DcpControl),
            0x89 => Ok(Opcode::SelectBucket),
            0x94 => Ok(Opcode::GetLocked),
            0x95 => Ok(Opcode::UnlockKey),
            _ => Err(()),
        }
    }
}
