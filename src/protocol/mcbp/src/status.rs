// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Response status numbers. A well written client handles unknown values:
/// any new status still means the requested operation was not performed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Success = 0x00,
    KeyEnoent = 0x01,
    KeyEexists = 0x02,
    E2big = 0x03,
    Einval = 0x04,
    NotStored = 0x05,
    DeltaBadval = 0x06,
    NotMyVbucket = 0x07,
    NoBucket = 0x08,
    Locked = 0x09,
    AuthStale = 0x1f,
    AuthError = 0x20,
    Eaccess = 0x24,
    UnknownCommand = 0x81,
    Enomem = 0x82,
    NotSupported = 0x83,
    Einternal = 0x84,
    Ebusy = 0x85,
    Etmpfail = 0x86,
}

impl Status {
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

impl TryFrom<u16> for Status {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        match value {
            0x00 => Ok(Status::Success),
            0x01 => Ok(Status::KeyEnoent),
            0x02 => Ok(Status::KeyEexists),
            0x03 => Ok(Status::E2big),
            0x04 => Ok(Status::Einval),
            0x05 => Ok(Status::NotStored),
            0x06 => Ok(Status::DeltaBadval),
            0x07 => Ok(Status::NotMyVbucket),
            0x08 => Ok(Status::NoBucket),
            0x09 => Ok(Status::Locked),
            0x1f => Ok(Status::AuthStale),
            0x20 => Ok(Status::AuthError),
            0x24 => Ok(Status::Eaccess),
            0x81 => Ok(Status::UnknownCommand),
            0x82 => Ok(Status::Enomem),
            0x83 => Ok(Status::NotSupported),
            0x84 => Ok(Status::Einternal),
            0x85 => Ok(Status::Ebusy),
            0x86 => Ok(Status::Etmpfail),
            _ => Err(()),
        }
    }
}
