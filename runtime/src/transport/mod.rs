// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Framed message transport between the manager and its servers. Each
//! frame is the 4-byte message code followed by that code's parameter
//! record; payload blobs ride behind their `DataInfo` reply.

pub mod manager;
pub mod server;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use helios_data::message::{Message, MsgCode};
use helios_data::Serializable;

use crate::error::{Error, Result};

/// Fixed parameter record size per code; `None` marks the one
/// length-prefixed record.
fn param_wire_size(code: MsgCode) -> Option<usize> {
    Some(match code {
        MsgCode::Disconnect
        | MsgCode::EndScene
        | MsgCode::UpdateScene
        | MsgCode::CheckAbort => 0,
        MsgCode::CreateThreads
        | MsgCode::ThreadCreated
        | MsgCode::SetScene
        | MsgCode::AllocateTag
        | MsgCode::TagAllocated
        | MsgCode::ProcessJob
        | MsgCode::JobFinished
        | MsgCode::IsAborted
        | MsgCode::StepProgress
        | MsgCode::Generic => 4,
        MsgCode::DataGenerated
        | MsgCode::DeleteData
        | MsgCode::SendData
        | MsgCode::DataInfo
        | MsgCode::FlushData => 8,
        MsgCode::HostAllocated | MsgCode::HostAuthorized => 12,
        MsgCode::CreateData => 20,
        MsgCode::Link => return None,
        MsgCode::Unknown => 0,
    })
}

pub async fn write_message<S>(stream: &mut S, msg: &Message) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(32);
    msg.write(&mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message<S>(stream: &mut S) -> Result<Message>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let code = MsgCode::from(u32::from_le_bytes(head));
    if code == MsgCode::Unknown {
        return Err(Error::ProtocolViolation(format!(
            "unknown message code {}",
            u32::from_le_bytes(head)
        )));
    }

    let mut frame = head.to_vec();
    match param_wire_size(code) {
        Some(n) => {
            let mut params = vec![0u8; n];
            stream.read_exact(&mut params).await?;
            frame.extend_from_slice(&params);
        }
        None => {
            // Length-prefixed record.
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await?;
            let n = u32::from_le_bytes(len) as usize;
            if n > MAX_NAME_BYTES {
                return Err(Error::ProtocolViolation(format!(
                    "oversized name field of {n} bytes"
                )));
            }
            let mut body = vec![0u8; n];
            stream.read_exact(&mut body).await?;
            frame.extend_from_slice(&len);
            frame.extend_from_slice(&body);
        }
    }

    Message::read(&mut &frame[..])
        .map_err(|e| Error::ProtocolViolation(format!("bad frame for {code:?}: {e}")))
}

const MAX_NAME_BYTES: usize = 4096;

pub async fn write_blob<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_blob<S>(stream: &mut S, len: usize) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Expects a specific reply shape, surfacing anything else as a
/// protocol violation.
pub fn expect_generic(msg: Message) -> Result<i32> {
    match msg {
        Message::Generic(p) => Ok(p.result),
        other => Err(Error::ProtocolViolation(format!(
            "expected generic reply, got {:?}",
            other.code()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helios_data::message::payload;

    #[test]
    fn test_frame_round_trip() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let (mut a, mut b) = tokio::io::duplex(1024);

                let sent = Message::CreateData(payload::CreateData {
                    type_code: 9,
                    size: 256,
                    flags: 3,
                    tag: 77,
                    host: 1,
                });
                write_message(&mut a, &sent).await.unwrap();
                write_message(&mut a, &Message::CheckAbort).await.unwrap();
                write_message(
                    &mut a,
                    &Message::Link(payload::Link {
                        module: "exr_output".into(),
                    }),
                )
                .await
                .unwrap();

                assert_eq!(read_message(&mut b).await.unwrap(), sent);
                assert_eq!(read_message(&mut b).await.unwrap(), Message::CheckAbort);
                match read_message(&mut b).await.unwrap() {
                    Message::Link(l) => assert_eq!(l.module, "exr_output"),
                    other => panic!("unexpected {other:?}"),
                }
            });
    }

    #[test]
    fn test_blob_follows_frame() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let (mut a, mut b) = tokio::io::duplex(1024);
                let payload = vec![7u8; 100];

                write_message(
                    &mut a,
                    &Message::DataInfo(payload::DataInfo {
                        size: payload.len() as u32,
                        inited: 1,
                    }),
                )
                .await
                .unwrap();
                write_blob(&mut a, &payload).await.unwrap();

                let Message::DataInfo(info) = read_message(&mut b).await.unwrap() else {
                    panic!("wrong frame");
                };
                let blob = read_blob(&mut b, info.size as usize).await.unwrap();
                assert_eq!(blob, payload);
            });
    }

    #[test]
    fn test_unknown_code_is_violation() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let (mut a, mut b) = tokio::io::duplex(64);
                a.write_all(&0xBADC_0DEu32.to_le_bytes()).await.unwrap();
                assert!(matches!(
                    read_message(&mut b).await,
                    Err(Error::ProtocolViolation(_))
                ));
            });
    }
}
