// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use protocol_mcbp::Status;

pub type EngineResult<T> = Result<T, ErrorCode>;

/// Status codes an engine operation may produce. `WouldBlock` parks the
/// calling command and is never put on the wire; `Disconnect` tears the
/// connection down without a response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    KeyNotFound,
    KeyExists,
    TooBig,
    Invalid,
    NotStored,
    DeltaBadval,
    NotMyVbucket,
    NoBucket,
    Locked,
    AuthStale,
    Eaccess,
    NotSupported,
    UnknownCommand,
    OutOfMemory,
    TmpFail,
    Internal,
    Busy,
    Failed,
    WouldBlock,
    Disconnect,
}

impl ErrorCode {
    /// Codes which require the extended-error feature to be represented on
    /// the wire. Without it they are downgraded by the per-connection remap.
    pub fn requires_xerror(&self) -> bool {
        matches!(
            self,
            ErrorCode::Locked | ErrorCode::AuthStale | ErrorCode::Eaccess | ErrorCode::NoBucket
        )
    }
}

impl From<ErrorCode> for Status {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::KeyNotFound => Status::KeyEnoent,
            ErrorCode::KeyExists => Status::KeyEexists,
            ErrorCode::TooBig => Status::E2big,
            ErrorCode::Invalid => Status::Einval,
            ErrorCode::NotStored => Status::NotStored,
            ErrorCode::DeltaBadval => Status::DeltaBadval,
            ErrorCode::NotMyVbucket => Status::NotMyVbucket,
            ErrorCode::NoBucket => Status::NoBucket,
            ErrorCode::Locked => Status::Locked,
            ErrorCode::AuthStale => Status::AuthStale,
            ErrorCode::Eaccess => Status::Eaccess,
            ErrorCode::NotSupported => Status::NotSupported,
            ErrorCode::UnknownCommand => Status::UnknownCommand,
            ErrorCode::OutOfMemory => Status::Enomem,
            ErrorCode::TmpFail => Status::Etmpfail,
            ErrorCode::Internal => Status::Einternal,
            ErrorCode::Busy => Status::Ebusy,
            ErrorCode::Failed => Status::Einternal,
            // these two never translate to a wire status
            ErrorCode::WouldBlock | ErrorCode::Disconnect => Status::Einternal,
        }
    }
}
