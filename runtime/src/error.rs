// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

use helios_data::{Tag, TypeCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no record for tag {0:#010x}")]
    UnknownTag(Tag),
    #[error("record {0:#010x} has outstanding leases")]
    BusyRecord(Tag),
    #[error("tag space exhausted")]
    OutOfTags,
    #[error("memory limit reached and nothing evictable")]
    OutOfMemory,
    #[error("generator failed for tag {0:#010x}")]
    GenerateFailed(Tag),
    #[error("record type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: TypeCode, found: TypeCode },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("operation timed out")]
    Timeout,
    #[error("render aborted")]
    Aborted,
    #[error("could not load plugin module {0}")]
    PluginLoadFailed(String),
    #[error("symbol {0} not found in any loaded module")]
    SymbolNotFound(String),
    #[error("job {job:#010x} failed with result {result}")]
    JobFailed { job: Tag, result: i32 },
    #[error("peer connection lost")]
    ConnectionLost,
    #[error("byte order of peer not reconciled")]
    NeedByteswap,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
