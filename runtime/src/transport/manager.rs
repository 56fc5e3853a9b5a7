// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Manager side of the farm. The manager owns the authoritative tag
//! space and database; each configured server becomes a remote worker
//! stub pulling from the same job queue as the local workers. While a
//! job runs remotely the stub services the peer's upstream requests and
//! applies its announced results into the local database afterwards.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{info, warn};

use helios_data::message::{payload, Message, PROTOCOL_CHECKSUM};
use helios_data::{Endian, HostId, Tag, MANAGER_HOST};

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::scheduler::{Process, Scheduler, JOB_FAILED};
use crate::transport::{expect_generic, read_blob, read_message, write_blob, write_message};

struct Peer {
    host: HostId,
    addr: String,
    need_swap: bool,
    conn: TcpStream,
}

/// The connected render farm. Connections are owned here between
/// phases and by the remote worker tasks during one.
pub struct RemoteFarm {
    runtime: Runtime,
    peers: Vec<Peer>,
    tasks: Vec<tokio::task::JoinHandle<Option<Peer>>>,
    stop: Option<watch::Sender<bool>>,
}

impl RemoteFarm {
    /// Connects and authorizes every configured server. A handshake
    /// failure is fatal; an unreachable server is skipped with a
    /// warning.
    pub fn connect(config: &Config, threads_per_server: u32) -> Result<RemoteFarm> {
        let runtime = Runtime::new()?;
        let mut peers = vec![];

        for (i, server) in config.servers.iter().enumerate() {
            let host = (i + 1) as HostId;
            let addr = format!("{}:{}", server.host_name, server.port_number);
            let conn = runtime.block_on(async {
                let stream = match TcpStream::connect(&addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%addr, "server unreachable: {e}");
                        return Ok::<_, Error>(None);
                    }
                };
                stream.set_nodelay(true).ok();
                Ok(Some(handshake(stream, host).await?))
            })?;

            if let Some((conn, need_swap)) = conn {
                info!(%addr, host, need_swap, "server authorized");
                peers.push(Peer {
                    host,
                    addr,
                    need_swap,
                    conn,
                });
            }
        }

        let mut farm = RemoteFarm {
            runtime,
            peers,
            tasks: vec![],
            stop: None,
        };
        farm.create_threads(threads_per_server)?;
        Ok(farm)
    }

    pub fn host_count(&self) -> usize {
        self.peers.len()
    }

    fn create_threads(&mut self, count: u32) -> Result<()> {
        self.for_each_peer(|conn| {
            Box::pin(async move {
                write_message(conn, &Message::CreateThreads(payload::CreateThreads { count }))
                    .await?;
                match read_message(conn).await? {
                    Message::ThreadCreated(p) => {
                        info!(threads = p.num_threads, "remote threads ready");
                        Ok(())
                    }
                    other => Err(Error::ProtocolViolation(format!(
                        "expected thread_created, got {:?}",
                        other.code()
                    ))),
                }
            })
        })
    }

    /// Asks every server to load a plugin module.
    pub fn link_module(&mut self, module: &str) -> Result<()> {
        let module = module.to_owned();
        self.for_each_peer(move |conn| {
            let module = module.clone();
            Box::pin(async move {
                write_message(conn, &Message::Link(payload::Link { module })).await?;
                if expect_generic(read_message(conn).await?)? != 0 {
                    return Err(Error::PluginLoadFailed("remote link".into()));
                }
                Ok(())
            })
        })
    }

    /// Announces every record header so peers can fetch payloads on
    /// demand. Re-announcements of known tags are no-ops peer-side.
    pub fn sync_headers(&mut self, db: &Database) -> Result<()> {
        let headers = db.headers();
        info!(records = headers.len(), "syncing record headers");
        self.for_each_peer(move |conn| {
            let headers = headers.clone();
            Box::pin(async move {
                for (tag, type_code, size, flags) in headers {
                    write_message(
                        conn,
                        &Message::CreateData(payload::CreateData {
                            type_code,
                            size,
                            flags,
                            tag,
                            host: MANAGER_HOST,
                        }),
                    )
                    .await?;
                    match read_message(conn).await? {
                        Message::DataGenerated(_) | Message::Generic(_) => {}
                        other => {
                            return Err(Error::ProtocolViolation(format!(
                                "unexpected create_data reply {:?}",
                                other.code()
                            )))
                        }
                    }
                }
                Ok(())
            })
        })
    }

    pub fn set_scene(&mut self, scene: Tag) -> Result<()> {
        self.simple_request(Message::SetScene(payload::SetScene { scene }))
    }

    pub fn update_scene(&mut self) -> Result<()> {
        self.simple_request(Message::UpdateScene)
    }

    pub fn end_scene(&mut self) -> Result<()> {
        self.simple_request(Message::EndScene)
    }

    fn simple_request(&mut self, msg: Message) -> Result<()> {
        self.for_each_peer(move |conn| {
            let msg = msg.clone();
            Box::pin(async move {
                write_message(conn, &msg).await?;
                if expect_generic(read_message(conn).await?)? != 0 {
                    return Err(Error::ProtocolViolation("peer rejected request".into()));
                }
                Ok(())
            })
        })
    }

    fn for_each_peer<F>(&mut self, f: F) -> Result<()>
    where
        F: for<'c> Fn(
            &'c mut TcpStream,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'c>>,
    {
        let mut lost = vec![];
        for (i, peer) in self.peers.iter_mut().enumerate() {
            if let Err(e) = self.runtime.block_on(f(&mut peer.conn)) {
                warn!(addr = %peer.addr, "peer dropped: {e}");
                lost.push(i);
            }
        }
        for i in lost.into_iter().rev() {
            self.peers.remove(i);
        }
        Ok(())
    }

    /// Hands every connection to a remote worker task pulling from the
    /// scheduler's queue.
    pub fn begin_phase(&mut self, db: &Arc<Database>, scheduler: &Arc<Scheduler>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);

        for peer in self.peers.drain(..) {
            let db = db.clone();
            let scheduler = scheduler.clone();
            let stop = stop_rx.clone();
            self.tasks
                .push(self.runtime.spawn(remote_worker(peer, db, scheduler, stop)));
        }
    }

    /// Recalls the connections; dead workers stay gone.
    pub fn end_phase(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _unused = stop.send(true);
        }
        for task in self.tasks.drain(..) {
            if let Ok(Some(peer)) = self.runtime.block_on(task) {
                self.peers.push(peer);
            }
        }
        self.peers.sort_by_key(|p| p.host);
    }

    /// Graceful farm shutdown.
    pub fn disconnect(mut self) -> Result<()> {
        self.end_phase();
        self.for_each_peer(|conn| {
            Box::pin(async move {
                write_message(conn, &Message::Disconnect).await?;
                expect_generic(read_message(conn).await?)?;
                Ok(())
            })
        })
    }
}

async fn handshake(mut stream: TcpStream, host: HostId) -> Result<(TcpStream, bool)> {
    write_message(
        &mut stream,
        &Message::HostAllocated(payload::HostAllocated {
            checksum: PROTOCOL_CHECKSUM,
            host,
            mgr_endian: Endian::native() as u32,
        }),
    )
    .await?;

    let auth = match read_message(&mut stream).await? {
        Message::HostAuthorized(p) => p,
        other => {
            return Err(Error::ProtocolViolation(format!(
                "expected host_authorized, got {:?}",
                other.code()
            )))
        }
    };
    if auth.checksum != helios_data::message::reply_checksum(PROTOCOL_CHECKSUM) || auth.result != 0
    {
        return Err(Error::ProtocolViolation("handshake rejected".into()));
    }
    Ok((stream, auth.need_byteswap != 0))
}

/// One job at a time: dispatch, service the peer's traffic until the
/// completion frame, then pull back everything the job announced.
async fn remote_worker(
    mut peer: Peer,
    db: Arc<Database>,
    scheduler: Arc<Scheduler>,
    mut stop: watch::Receiver<bool>,
) -> Option<Peer> {
    let queue = scheduler.queue();
    loop {
        let job = tokio::select! {
            job = queue.recv() => match job {
                Ok(job) => job,
                Err(_) => return Some(peer),
            },
            _ = stop.changed() => return Some(peer),
        };

        let Some(process) = scheduler.current() else {
            // Phase raced shut; put the job back for the next one.
            let _unused = queue.send(job).await;
            continue;
        };
        if process.aborted() {
            let _unused = queue.send(job).await;
            continue;
        }

        process.job_started(job);
        match run_remote_job(&mut peer, &db, &process, job).await {
            Ok(result) => process.job_finished(job, result),
            Err(e) => {
                // The worker is evicted; its job goes back to the pool.
                warn!(addr = %peer.addr, "remote worker lost: {e}");
                process.job_requeued(job);
                let _unused = queue.send(job).await;
                return None;
            }
        }
    }
}

async fn run_remote_job(
    peer: &mut Peer,
    db: &Arc<Database>,
    process: &Arc<Process>,
    job: Tag,
) -> Result<i32> {
    let conn = &mut peer.conn;
    write_message(conn, &Message::new_process_job(job)).await?;

    let mut announced: Vec<Tag> = vec![];
    let result = loop {
        match read_message(conn).await? {
            Message::AllocateTag(_) => {
                let tag = db.allocate_local_tag()?;
                write_message(conn, &Message::new_tag_allocated(tag)).await?;
            }
            Message::SendData(p) => {
                let (_, bytes, inited) = db.snapshot(p.data)?;
                write_message(
                    conn,
                    &Message::DataInfo(payload::DataInfo {
                        size: bytes.len() as u32,
                        inited: inited as u32,
                    }),
                )
                .await?;
                write_blob(conn, &bytes).await?;
                db.add_holder(p.data, peer.host)?;
            }
            Message::CreateData(p) => {
                db.create_at(p.tag, p.type_code, p.size as usize, p.flags, p.host)?;
                write_message(
                    conn,
                    &Message::DataGenerated(payload::DataGenerated {
                        data: p.tag,
                        host: MANAGER_HOST,
                    }),
                )
                .await?;
            }
            Message::DeleteData(p) => {
                if let Err(e) = db.delete(p.data) {
                    warn!(tag = p.data, "remote delete failed: {e}");
                }
                write_message(conn, &Message::new_generic(0)).await?;
            }
            Message::FlushData(p) => {
                if let Err(e) = db.invalidate(p.data) {
                    warn!(tag = p.data, "remote flush failed: {e}");
                }
                write_message(conn, &Message::new_generic(0)).await?;
            }
            Message::DataGenerated(p) => {
                db.mark_generated_remote(p.data, p.host).ok();
                announced.push(p.data);
            }
            Message::StepProgress(p) => {
                process.step(p.count);
                write_message(conn, &Message::new_generic(0)).await?;
            }
            Message::CheckAbort => {
                write_message(conn, &Message::new_is_aborted(process.aborted())).await?;
            }
            Message::JobFinished(p) => break p.result,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected frame during job: {:?}",
                    other.code()
                )))
            }
        }
    };

    // Pull the payloads the job produced or changed.
    for tag in announced {
        write_message(conn, &Message::new_send_data(tag, false)).await?;
        let info = match read_message(conn).await? {
            Message::DataInfo(p) => p,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected data_info, got {:?}",
                    other.code()
                )))
            }
        };
        let mut bytes = read_blob(conn, info.size as usize).await?;
        if peer.need_swap {
            let type_code = db.type_of(tag)?;
            db.byteswap(type_code, &mut bytes);
        }
        db.install_bytes(tag, &bytes, info.inited != 0)?;
    }

    if result == JOB_FAILED {
        warn!(job, addr = %peer.addr, "remote job failed");
    }
    Ok(result)
}
