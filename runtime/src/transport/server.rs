// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! The server peer. It accepts one manager connection, answers control
//! messages, spawns local worker threads on demand, and runs incoming
//! jobs against its own database replica. While a job is running the
//! socket carries the workers' upstream traffic (tag allocation, data
//! fetches, abort polls); the manager only replies during that window,
//! so the connection task can own both directions without framing
//! ambiguity.

use std::sync::Arc;

use async_channel::Sender;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use helios_data::message::{payload, AsyncQueue, Message, PROTOCOL_CHECKSUM};
use helios_data::{Endian, HostId, Tag, TypeCode};

use crate::db::{Database, Fetched, PeerLink};
use crate::error::{Error, Result};
use crate::plugin::PluginSystem;
use crate::scheduler::{AbortFlag, AbortSource, JOB_ABORTED, JOB_FAILED};
use crate::tls::Tls;
use crate::transport::{read_blob, read_message, write_blob, write_message};

/// Scene lifecycle callbacks a render pipeline installs on its server.
pub trait SceneHooks: Send + Sync {
    fn set_scene(&self, db: &Database, scene: Tag) -> Result<()> {
        let _ = (db, scene);
        Ok(())
    }
    fn update_scene(&self, db: &Database) -> Result<()> {
        let _ = db;
        Ok(())
    }
    fn end_scene(&self, db: &Database) -> Result<()> {
        let _ = db;
        Ok(())
    }
}

/// Hooks for pipelines with no scene-install work.
pub struct NoHooks;
impl SceneHooks for NoHooks {}

/// Traffic sent up to the manager by worker threads while a job runs.
enum Upcall {
    /// Round trip expecting one reply frame.
    Request {
        msg: Message,
        reply: tokio::sync::oneshot::Sender<Message>,
    },
    /// Round trip expecting `DataInfo` plus a payload blob.
    Fetch {
        tag: Tag,
        reply: tokio::sync::oneshot::Sender<Result<Fetched>>,
    },
    /// One-way frame.
    Inform { msg: Message },
    /// A worker finished the active job.
    JobDone { result: i32 },
}

/// Database peer link of a server host; every operation is a message
/// round trip through the connection task.
struct ServerLink {
    host: HostId,
    need_swap: bool,
    upcalls: Sender<Upcall>,
}

impl ServerLink {
    fn request(&self, msg: Message) -> Result<Message> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.upcalls
            .send_blocking(Upcall::Request { msg, reply: tx })
            .map_err(|_| Error::ConnectionLost)?;
        rx.blocking_recv().map_err(|_| Error::ConnectionLost)
    }
}

impl PeerLink for ServerLink {
    fn host(&self) -> HostId {
        self.host
    }

    fn need_byteswap(&self) -> bool {
        self.need_swap
    }

    fn allocate_tag(&self) -> Result<Tag> {
        match self.request(Message::new_allocate_tag(self.host))? {
            Message::TagAllocated(p) => Ok(p.tag),
            other => Err(Error::ProtocolViolation(format!(
                "expected tag_allocated, got {:?}",
                other.code()
            ))),
        }
    }

    fn fetch(&self, tag: Tag, _owner: HostId) -> Result<Fetched> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.upcalls
            .send_blocking(Upcall::Fetch { tag, reply: tx })
            .map_err(|_| Error::ConnectionLost)?;
        rx.blocking_recv().map_err(|_| Error::ConnectionLost)?
    }

    fn notify_created(&self, tag: Tag, type_code: TypeCode, size: u32, flags: u32) -> Result<()> {
        let msg = Message::CreateData(payload::CreateData {
            type_code,
            size,
            flags,
            tag,
            host: self.host,
        });
        match self.request(msg)? {
            Message::DataGenerated(_) | Message::Generic(_) => Ok(()),
            other => Err(Error::ProtocolViolation(format!(
                "unexpected create_data reply {:?}",
                other.code()
            ))),
        }
    }

    fn notify_deleted(&self, tag: Tag) -> Result<()> {
        self.request(Message::DeleteData(payload::DeleteData {
            data: tag,
            host: self.host,
        }))?;
        Ok(())
    }

    fn notify_generated(&self, tag: Tag) -> Result<()> {
        self.upcalls
            .send_blocking(Upcall::Inform {
                msg: Message::DataGenerated(payload::DataGenerated {
                    data: tag,
                    host: self.host,
                }),
            })
            .map_err(|_| Error::ConnectionLost)
    }

    fn flush(&self, tag: Tag, _holders: &[HostId]) -> Result<()> {
        self.request(Message::FlushData(payload::FlushData {
            data: tag,
            host: self.host,
        }))?;
        Ok(())
    }
}

/// Abort polling back to the manager, bounded by the refresh cadence in
/// the scheduler.
struct RemoteAbort {
    upcalls: Sender<Upcall>,
}

impl AbortSource for RemoteAbort {
    fn poll_abort(&self) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .upcalls
            .send_blocking(Upcall::Request {
                msg: Message::CheckAbort,
                reply: tx,
            })
            .is_err()
        {
            return true;
        }
        match rx.blocking_recv() {
            Ok(Message::IsAborted(p)) => p.abort != 0,
            _ => true,
        }
    }
}

pub struct ServerSrv {
    port: u16,
    db: Arc<Database>,
    plugins: Arc<PluginSystem>,
    hooks: Arc<dyn SceneHooks>,
}

impl ServerSrv {
    pub fn new(
        port: u16,
        db: Arc<Database>,
        plugins: Arc<PluginSystem>,
        hooks: Arc<dyn SceneHooks>,
    ) -> ServerSrv {
        ServerSrv {
            port,
            db,
            plugins,
            hooks,
        }
    }

    /// Accept loop. Managers are served one at a time; a disconnect
    /// returns the server to accepting.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        self.run_on(listener).await
    }

    /// Accept loop over a listener bound by the caller.
    pub async fn run_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "render server listening");

        loop {
            let (stream, addr) = listener.accept().await?;
            info!(%addr, "manager connected");
            stream.set_nodelay(true).ok();
            if let Err(e) = self.serve_connection(stream).await {
                error!(%addr, "connection ended with error: {e}");
            } else {
                info!(%addr, "manager disconnected");
            }
        }
    }

    /// Runs the protocol over one established stream.
    pub async fn serve_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Handshake: fatal on any mismatch.
        let hello = match read_message(&mut stream).await? {
            Message::HostAllocated(p) => p,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected host_allocated, got {:?}",
                    other.code()
                )))
            }
        };
        if hello.checksum != PROTOCOL_CHECKSUM {
            return Err(Error::ProtocolViolation("bad handshake checksum".into()));
        }
        let need_swap = Endian::from(hello.mgr_endian) != Endian::native();
        write_message(
            &mut stream,
            &Message::HostAuthorized(payload::HostAuthorized {
                checksum: helios_data::message::reply_checksum(hello.checksum),
                result: 0,
                need_byteswap: need_swap as u32,
            }),
        )
        .await?;

        let (upcall_tx, upcall_rx) = async_channel::unbounded::<Upcall>();
        self.db.set_peer(Arc::new(ServerLink {
            host: hello.host,
            need_swap,
            upcalls: upcall_tx.clone(),
        }));

        let result = self
            .connection_loop(&mut stream, hello.host, upcall_tx, upcall_rx)
            .await;

        self.db.clear_peer();
        result
    }

    async fn connection_loop<S>(
        &self,
        stream: &mut S,
        host: HostId,
        upcall_tx: Sender<Upcall>,
        upcall_rx: async_channel::Receiver<Upcall>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let jobs: AsyncQueue<Tag> = AsyncQueue::default();
        let abort = Arc::new(AbortFlag::new());
        abort.set_source(Arc::new(RemoteAbort {
            upcalls: upcall_tx.clone(),
        }));
        let mut workers: Vec<std::thread::JoinHandle<()>> = vec![];
        let mut active_job: Option<Tag> = None;

        let result = loop {
            if active_job.is_some() {
                // Workers own the socket's upstream direction while the
                // job runs; the manager only replies.
                let Ok(upcall) = upcall_rx.recv().await else {
                    break Err(Error::ConnectionLost);
                };
                match upcall {
                    Upcall::Request { msg, reply } => {
                        write_message(stream, &msg).await?;
                        let response = read_message(stream).await?;
                        let _unused = reply.send(response);
                    }
                    Upcall::Fetch { tag, reply } => {
                        let outcome = self.fetch_over(stream, tag).await;
                        let disconnected = outcome.is_err();
                        let _unused = reply.send(outcome);
                        if disconnected {
                            break Err(Error::ConnectionLost);
                        }
                    }
                    Upcall::Inform { msg } => {
                        write_message(stream, &msg).await?;
                    }
                    Upcall::JobDone { result } => {
                        // Everything the job changed travels back before
                        // the completion frame.
                        for tag in self.db.take_dirty() {
                            write_message(
                                stream,
                                &Message::DataGenerated(payload::DataGenerated {
                                    data: tag,
                                    host,
                                }),
                            )
                            .await?;
                        }
                        write_message(stream, &Message::new_job_finished(result)).await?;
                        active_job = None;
                    }
                }
                continue;
            }

            let msg = match read_message(stream).await {
                Ok(m) => m,
                Err(e) => break Err(e),
            };
            match msg {
                Message::CreateThreads(p) => {
                    let first = workers.len();
                    for i in 0..p.count as usize {
                        workers.push(spawn_worker(
                            first + i,
                            self.db.clone(),
                            jobs.clone(),
                            abort.clone(),
                            upcall_tx.clone(),
                        ));
                    }
                    info!(count = p.count, "worker threads created");
                    write_message(
                        stream,
                        &Message::ThreadCreated(payload::ThreadCreated {
                            num_threads: workers.len() as u32,
                        }),
                    )
                    .await?;
                }
                Message::Link(p) => {
                    let result = match self.plugins.link(&p.module) {
                        Ok(()) => 0,
                        Err(e) => {
                            error!(module = %p.module, "link failed: {e}");
                            -1
                        }
                    };
                    write_message(stream, &Message::new_generic(result)).await?;
                }
                Message::SetScene(p) => {
                    let result = match self.hooks.set_scene(&self.db, p.scene) {
                        Ok(()) => 0,
                        Err(e) => {
                            error!("set_scene failed: {e}");
                            -1
                        }
                    };
                    write_message(stream, &Message::new_generic(result)).await?;
                }
                Message::UpdateScene => {
                    let result = self.hooks.update_scene(&self.db).map(|_| 0).unwrap_or(-1);
                    write_message(stream, &Message::new_generic(result)).await?;
                }
                Message::EndScene => {
                    let result = self.hooks.end_scene(&self.db).map(|_| 0).unwrap_or(-1);
                    write_message(stream, &Message::new_generic(result)).await?;
                }
                Message::CreateData(p) => {
                    if let Err(e) =
                        self.db
                            .create_at(p.tag, p.type_code, p.size as usize, p.flags, p.host)
                    {
                        warn!(tag = p.tag, "create_data failed: {e}");
                    }
                    write_message(
                        stream,
                        &Message::DataGenerated(payload::DataGenerated {
                            data: p.tag,
                            host,
                        }),
                    )
                    .await?;
                }
                Message::DeleteData(p) => {
                    if let Err(e) = self.db.delete(p.data) {
                        warn!(tag = p.data, "delete_data failed: {e}");
                    }
                    write_message(stream, &Message::new_generic(0)).await?;
                }
                Message::SendData(p) => {
                    let (_, bytes, inited) = self.db.snapshot(p.data)?;
                    write_message(
                        stream,
                        &Message::DataInfo(payload::DataInfo {
                            size: bytes.len() as u32,
                            inited: inited as u32,
                        }),
                    )
                    .await?;
                    write_blob(stream, &bytes).await?;
                }
                Message::FlushData(p) => {
                    if let Err(e) = self.db.invalidate(p.data) {
                        warn!(tag = p.data, "flush_data failed: {e}");
                    }
                    write_message(stream, &Message::new_generic(0)).await?;
                }
                Message::ProcessJob(p) => {
                    if workers.is_empty() {
                        write_message(stream, &Message::new_job_finished(JOB_FAILED)).await?;
                        continue;
                    }
                    active_job = Some(p.job);
                    jobs.send(p.job).await.map_err(|_| Error::ConnectionLost)?;
                }
                Message::CheckAbort => {
                    write_message(stream, &Message::new_is_aborted(abort.is_set())).await?;
                }
                Message::Disconnect => {
                    write_message(stream, &Message::new_generic(0)).await?;
                    break Ok(());
                }
                other => {
                    break Err(Error::ProtocolViolation(format!(
                        "unexpected request {:?}",
                        other.code()
                    )));
                }
            }
        };

        // Tear down worker threads before giving up the connection.
        // Draining pending upcalls drops their reply channels, so a
        // worker blocked on a round trip errors out instead of hanging.
        jobs.close();
        abort.set();
        upcall_rx.close();
        while upcall_rx.try_recv().is_ok() {}
        for w in workers {
            let _unused = w.join();
        }
        result
    }

    async fn fetch_over<S>(&self, stream: &mut S, tag: Tag) -> Result<Fetched>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_message(stream, &Message::new_send_data(tag, false)).await?;
        let info = match read_message(stream).await? {
            Message::DataInfo(p) => p,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected data_info, got {:?}",
                    other.code()
                )))
            }
        };
        let bytes = read_blob(stream, info.size as usize).await?;
        Ok(Fetched {
            bytes,
            inited: info.inited != 0,
        })
    }
}

fn spawn_worker(
    index: usize,
    db: Arc<Database>,
    jobs: AsyncQueue<Tag>,
    abort: Arc<AbortFlag>,
    upcalls: Sender<Upcall>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        Tls::init_worker(index);
        Tls::install_abort(abort.clone());
        while let Ok(job) = jobs.recv_blocking() {
            let result = match db.execute_job(job, Tls) {
                Ok(code) => code,
                Err(Error::Aborted) => JOB_ABORTED,
                Err(e) => {
                    warn!(job, "job failed: {e}");
                    JOB_FAILED
                }
            };
            abort.refresh();
            if upcalls
                .send_blocking(Upcall::JobDone { result })
                .is_err()
            {
                break;
            }
        }
        Tls::clear_abort();
    })
}
