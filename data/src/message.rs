// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Framed messages exchanged between the manager and its rendering
//! servers. Every frame is a 4-byte message code followed by the fixed
//! parameter record of that code; record payload transfers follow their
//! `DataInfo` reply as a raw byte blob of the declared length.

use std::io::{self, Read, Write};

use async_channel::TrySendError;

use crate::{HostId, Serializable, Tag, TypeCode};

/// Handshake constant sent by the manager inside `HostAllocated`.
pub const PROTOCOL_CHECKSUM: u32 = 0x6865_6c73;

/// The checksum a peer must echo back inside `HostAuthorized`.
pub const fn reply_checksum(checksum: u32) -> u32 {
    !checksum
}

/// Wire code of every message. Requests first, replies after.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgCode {
    // Control requests
    Disconnect = 1,
    CreateThreads = 2,
    Link = 3,
    SetScene = 4,
    EndScene = 5,
    UpdateScene = 6,

    // Database traffic
    AllocateTag = 7,
    ProcessJob = 8,
    CreateData = 9,
    DeleteData = 10,
    SendData = 11,
    FlushData = 12,

    // Progress and cancellation
    CheckAbort = 13,
    StepProgress = 14,

    // Replies
    Generic = 15,
    HostAllocated = 16,
    HostAuthorized = 17,
    TagAllocated = 18,
    DataGenerated = 19,
    ThreadCreated = 20,
    JobFinished = 21,
    IsAborted = 22,
    DataInfo = 23,

    #[default]
    Unknown = 0xFFFF_FFFF,
}

macro_rules! map_code {
    ($v:expr, $enum_v:expr) => {
        if $v == $enum_v as u32 {
            return $enum_v;
        }
    };
}

impl From<u32> for MsgCode {
    fn from(v: u32) -> Self {
        map_code!(v, MsgCode::Disconnect);
        map_code!(v, MsgCode::CreateThreads);
        map_code!(v, MsgCode::Link);
        map_code!(v, MsgCode::SetScene);
        map_code!(v, MsgCode::EndScene);
        map_code!(v, MsgCode::UpdateScene);
        map_code!(v, MsgCode::AllocateTag);
        map_code!(v, MsgCode::ProcessJob);
        map_code!(v, MsgCode::CreateData);
        map_code!(v, MsgCode::DeleteData);
        map_code!(v, MsgCode::SendData);
        map_code!(v, MsgCode::FlushData);
        map_code!(v, MsgCode::CheckAbort);
        map_code!(v, MsgCode::StepProgress);
        map_code!(v, MsgCode::Generic);
        map_code!(v, MsgCode::HostAllocated);
        map_code!(v, MsgCode::HostAuthorized);
        map_code!(v, MsgCode::TagAllocated);
        map_code!(v, MsgCode::DataGenerated);
        map_code!(v, MsgCode::ThreadCreated);
        map_code!(v, MsgCode::JobFinished);
        map_code!(v, MsgCode::IsAborted);
        map_code!(v, MsgCode::DataInfo);

        MsgCode::Unknown
    }
}

impl From<MsgCode> for u32 {
    fn from(c: MsgCode) -> Self {
        c as u32
    }
}

pub mod payload {
    use super::*;

    /// Manager assigns a host id and announces its byte order.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HostAllocated {
        pub checksum: u32,
        pub host: HostId,
        pub mgr_endian: u32,
    }

    /// Peer acknowledges the handshake and reports whether payloads
    /// need a byte-swap on its side.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HostAuthorized {
        pub checksum: u32,
        pub result: i32,
        pub need_byteswap: u32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CreateThreads {
        pub count: u32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadCreated {
        pub num_threads: u32,
    }

    /// Ask the peer to load a plugin module by name.
    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub struct Link {
        pub module: String,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SetScene {
        pub scene: Tag,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AllocateTag {
        pub host: HostId,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TagAllocated {
        pub tag: Tag,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessJob {
        pub job: Tag,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct JobFinished {
        pub result: i32,
    }

    /// Peer created a record at a manager-minted tag.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CreateData {
        pub type_code: TypeCode,
        pub size: u32,
        pub flags: u32,
        pub tag: Tag,
        pub host: HostId,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DataGenerated {
        pub data: Tag,
        pub host: HostId,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteData {
        pub data: Tag,
        pub host: HostId,
    }

    /// Request transfer of a record; the reply is `DataInfo` followed by
    /// the raw payload bytes.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SendData {
        pub data: Tag,
        pub defer_init: u32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DataInfo {
        pub size: u32,
        pub inited: u32,
    }

    /// The named record must be re-fetched by the peer on next access.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FlushData {
        pub data: Tag,
        pub host: HostId,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct IsAborted {
        pub abort: u32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct StepProgress {
        pub count: u32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Generic {
        pub result: i32,
    }
}

/// Message definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Disconnect,
    CreateThreads(payload::CreateThreads),
    Link(payload::Link),
    SetScene(payload::SetScene),
    EndScene,
    UpdateScene,
    AllocateTag(payload::AllocateTag),
    ProcessJob(payload::ProcessJob),
    CreateData(payload::CreateData),
    DeleteData(payload::DeleteData),
    SendData(payload::SendData),
    FlushData(payload::FlushData),
    CheckAbort,
    StepProgress(payload::StepProgress),
    Generic(payload::Generic),
    HostAllocated(payload::HostAllocated),
    HostAuthorized(payload::HostAuthorized),
    TagAllocated(payload::TagAllocated),
    DataGenerated(payload::DataGenerated),
    ThreadCreated(payload::ThreadCreated),
    JobFinished(payload::JobFinished),
    IsAborted(payload::IsAborted),
    DataInfo(payload::DataInfo),
}

impl Message {
    pub fn code(&self) -> MsgCode {
        match self {
            Message::Disconnect => MsgCode::Disconnect,
            Message::CreateThreads(_) => MsgCode::CreateThreads,
            Message::Link(_) => MsgCode::Link,
            Message::SetScene(_) => MsgCode::SetScene,
            Message::EndScene => MsgCode::EndScene,
            Message::UpdateScene => MsgCode::UpdateScene,
            Message::AllocateTag(_) => MsgCode::AllocateTag,
            Message::ProcessJob(_) => MsgCode::ProcessJob,
            Message::CreateData(_) => MsgCode::CreateData,
            Message::DeleteData(_) => MsgCode::DeleteData,
            Message::SendData(_) => MsgCode::SendData,
            Message::FlushData(_) => MsgCode::FlushData,
            Message::CheckAbort => MsgCode::CheckAbort,
            Message::StepProgress(_) => MsgCode::StepProgress,
            Message::Generic(_) => MsgCode::Generic,
            Message::HostAllocated(_) => MsgCode::HostAllocated,
            Message::HostAuthorized(_) => MsgCode::HostAuthorized,
            Message::TagAllocated(_) => MsgCode::TagAllocated,
            Message::DataGenerated(_) => MsgCode::DataGenerated,
            Message::ThreadCreated(_) => MsgCode::ThreadCreated,
            Message::JobFinished(_) => MsgCode::JobFinished,
            Message::IsAborted(_) => MsgCode::IsAborted,
            Message::DataInfo(_) => MsgCode::DataInfo,
        }
    }

    /// Creates the reply carrying a bare result code.
    pub fn new_generic(result: i32) -> Message {
        Message::Generic(payload::Generic { result })
    }

    pub fn new_process_job(job: Tag) -> Message {
        Message::ProcessJob(payload::ProcessJob { job })
    }

    pub fn new_job_finished(result: i32) -> Message {
        Message::JobFinished(payload::JobFinished { result })
    }

    pub fn new_allocate_tag(host: HostId) -> Message {
        Message::AllocateTag(payload::AllocateTag { host })
    }

    pub fn new_tag_allocated(tag: Tag) -> Message {
        Message::TagAllocated(payload::TagAllocated { tag })
    }

    pub fn new_send_data(data: Tag, defer_init: bool) -> Message {
        Message::SendData(payload::SendData {
            data,
            defer_init: defer_init as u32,
        })
    }

    pub fn new_is_aborted(abort: bool) -> Message {
        Message::IsAborted(payload::IsAborted {
            abort: abort as u32,
        })
    }
}

impl Serializable for Message {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.code() as u32).to_le_bytes())?;

        match self {
            Message::Disconnect
            | Message::EndScene
            | Message::UpdateScene
            | Message::CheckAbort => Ok(()),
            Message::CreateThreads(p) => p.write(w),
            Message::Link(p) => p.write(w),
            Message::SetScene(p) => p.write(w),
            Message::AllocateTag(p) => p.write(w),
            Message::ProcessJob(p) => p.write(w),
            Message::CreateData(p) => p.write(w),
            Message::DeleteData(p) => p.write(w),
            Message::SendData(p) => p.write(w),
            Message::FlushData(p) => p.write(w),
            Message::StepProgress(p) => p.write(w),
            Message::Generic(p) => p.write(w),
            Message::HostAllocated(p) => p.write(w),
            Message::HostAuthorized(p) => p.write(w),
            Message::TagAllocated(p) => p.write(w),
            Message::DataGenerated(p) => p.write(w),
            Message::ThreadCreated(p) => p.write(w),
            Message::JobFinished(p) => p.write(w),
            Message::IsAborted(p) => p.write(w),
            Message::DataInfo(p) => p.write(w),
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let code = MsgCode::from(Self::read_u32_le(r)?);

        let msg = match code {
            MsgCode::Disconnect => Message::Disconnect,
            MsgCode::EndScene => Message::EndScene,
            MsgCode::UpdateScene => Message::UpdateScene,
            MsgCode::CheckAbort => Message::CheckAbort,
            MsgCode::CreateThreads => Message::CreateThreads(payload::CreateThreads::read(r)?),
            MsgCode::Link => Message::Link(payload::Link::read(r)?),
            MsgCode::SetScene => Message::SetScene(payload::SetScene::read(r)?),
            MsgCode::AllocateTag => Message::AllocateTag(payload::AllocateTag::read(r)?),
            MsgCode::ProcessJob => Message::ProcessJob(payload::ProcessJob::read(r)?),
            MsgCode::CreateData => Message::CreateData(payload::CreateData::read(r)?),
            MsgCode::DeleteData => Message::DeleteData(payload::DeleteData::read(r)?),
            MsgCode::SendData => Message::SendData(payload::SendData::read(r)?),
            MsgCode::FlushData => Message::FlushData(payload::FlushData::read(r)?),
            MsgCode::StepProgress => Message::StepProgress(payload::StepProgress::read(r)?),
            MsgCode::Generic => Message::Generic(payload::Generic::read(r)?),
            MsgCode::HostAllocated => Message::HostAllocated(payload::HostAllocated::read(r)?),
            MsgCode::HostAuthorized => Message::HostAuthorized(payload::HostAuthorized::read(r)?),
            MsgCode::TagAllocated => Message::TagAllocated(payload::TagAllocated::read(r)?),
            MsgCode::DataGenerated => Message::DataGenerated(payload::DataGenerated::read(r)?),
            MsgCode::ThreadCreated => Message::ThreadCreated(payload::ThreadCreated::read(r)?),
            MsgCode::JobFinished => Message::JobFinished(payload::JobFinished::read(r)?),
            MsgCode::IsAborted => Message::IsAborted(payload::IsAborted::read(r)?),
            MsgCode::DataInfo => Message::DataInfo(payload::DataInfo::read(r)?),
            MsgCode::Unknown => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown message code"))
            }
        };

        Ok(msg)
    }
}

/// AsyncQueue is a thin wrapper of async_channel.
#[derive(Clone)]
pub struct AsyncQueue<M> {
    receiver: async_channel::Receiver<M>,
    sender: async_channel::Sender<M>,
}

impl<M> Default for AsyncQueue<M> {
    fn default() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self { receiver, sender }
    }
}

impl<M> AsyncQueue<M> {
    pub fn bounded(cap: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(cap);
        Self { receiver, sender }
    }

    pub fn send(&self, msg: M) -> async_channel::Send<'_, M> {
        self.sender.send(msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), TrySendError<M>> {
        self.sender.try_send(msg)
    }

    pub fn send_blocking(&self, msg: M) -> Result<(), async_channel::SendError<M>> {
        self.sender.send_blocking(msg)
    }

    pub fn recv(&self) -> async_channel::Recv<'_, M> {
        self.receiver.recv()
    }

    pub fn recv_blocking(&self) -> Result<M, async_channel::RecvError> {
        self.receiver.recv_blocking()
    }

    pub fn try_recv(&self) -> Result<M, async_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Closes both endpoints; pending receivers drain then error out.
    pub fn close(&self) {
        self.receiver.close();
    }
}
