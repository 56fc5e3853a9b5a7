// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Manager/server protocol exercised end to end inside one process:
//! two databases, a real socket in between.

use std::sync::Arc;

use helios_data::message::{payload, Message, PROTOCOL_CHECKSUM};
use helios_data::{Endian, Tag, TypeCode, NULL_TAG};

use helios_runtime::collections::datamap::DataMap;
use helios_runtime::db::{builtin, Database, DbValue, TypeOps, DB_FLUSHABLE};
use helios_runtime::plugin::PluginSystem;
use helios_runtime::scheduler::{Process, Scheduler, SilentEvents, JOB_OK};
use helios_runtime::transport::manager::RemoteFarm;
use helios_runtime::transport::server::{NoHooks, ServerSrv};
use helios_runtime::transport::{read_blob, read_message, write_blob, write_message};
use helios_runtime::{Config, Error, Tls};

const T_BLOB: TypeCode = 30;
const T_FARM_JOB: TypeCode = 31;
const T_PAIR: TypeCode = 32;
const T_PAIR_JOB: TypeCode = 33;

#[derive(Clone, Copy)]
#[repr(C)]
struct FarmJob {
    input: i32,
    output: i32,
    created: Tag,
    host: u32,
}
unsafe impl DbValue for FarmJob {}

fn execute_farm_job(db: &Database, job: Tag, _tls: Tls) -> helios_runtime::Result<i32> {
    let input = {
        let lease = db.access(job)?;
        lease.get::<FarmJob>().input
    };

    // Allocating goes through the manager on a server host.
    let (extra, lease) = db.create(T_BLOB, 16, 0)?;
    for (i, b) in lease.as_mut_slice().iter_mut().enumerate() {
        *b = input as u8 ^ i as u8;
    }
    drop(lease);
    db.dirt(extra)?;

    let lease = db.access(job)?;
    {
        let data = lease.get_mut::<FarmJob>();
        data.output = input * 2;
        data.created = extra;
        data.host = db.host();
    }
    drop(lease);
    db.dirt(job)?;
    Ok(JOB_OK)
}

fn register_farm_types(db: &Database) {
    builtin::register(db);
    db.register_type(T_BLOB, TypeOps::opaque("blob"));
    db.register_type(
        T_FARM_JOB,
        TypeOps {
            name: "farm_job",
            atomic_size: 0,
            byteswap: None,
            generate: None,
            execute: Some(execute_farm_job),
        },
    );
}

fn spawn_server(db: Arc<Database>) -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let srv = ServerSrv::new(
                0,
                db,
                PluginSystem::new(vec![]),
                Arc::new(NoHooks),
            );
            // One connection is enough for the test; run_on loops.
            let _unused = srv.run_on(listener).await;
        });
    });
    let addr = addr_rx.recv().unwrap();
    (addr, handle)
}

#[test]
fn test_remote_job_round_trip() {
    let server_db = Arc::new(Database::new(0));
    register_farm_types(&server_db);
    let (addr, _server) = spawn_server(server_db);

    let db = Arc::new(Database::new(0));
    register_farm_types(&db);

    let mut config = Config::default();
    config.servers.push(helios_runtime::config::HostDesc {
        host_name: addr.ip().to_string(),
        port_number: addr.port(),
    });

    // Jobs created before connecting travel via the header sync.
    let jobs: Vec<Tag> = (1..=4i32)
        .map(|input| {
            let (tag, lease) = db
                .create(T_FARM_JOB, std::mem::size_of::<FarmJob>(), 0)
                .unwrap();
            lease.get_mut::<FarmJob>().input = input;
            drop(lease);
            tag
        })
        .collect();

    let mut farm = RemoteFarm::connect(&config, 2).unwrap();
    assert_eq!(farm.host_count(), 1);
    farm.sync_headers(&db).unwrap();
    farm.set_scene(NULL_TAG).unwrap();

    // No local workers: everything must run on the peer.
    let scheduler = Arc::new(Scheduler::new(0));
    farm.begin_phase(&db, &scheduler);
    let process = Process::new(jobs.len(), Box::new(SilentEvents));
    scheduler.execute(&db, jobs.clone(), &process).unwrap();
    farm.end_phase();

    assert_eq!(process.failed_jobs(), 0);

    for (i, job) in jobs.iter().enumerate() {
        let lease = db.access(*job).unwrap();
        let data = *lease.get::<FarmJob>();
        drop(lease);

        assert_eq!(data.output, (i as i32 + 1) * 2);
        assert_eq!(data.host, 1, "job must have run on the remote host");
        assert_ne!(data.created, NULL_TAG);

        // The record the job created on the peer came back with it.
        let lease = db.access(data.created).unwrap();
        let bytes: Vec<u8> = lease.as_slice().to_vec();
        assert_eq!(bytes.len(), 16);
        for (k, b) in bytes.iter().enumerate() {
            assert_eq!(*b, (i as u8 + 1) ^ k as u8);
        }
    }

    farm.end_scene().unwrap();
    farm.disconnect().unwrap();
}

// ---- simulated cross-endian transfer --------------------------------

#[derive(Clone, Copy)]
#[repr(C)]
struct Pair {
    number: i32,
    scalar: f32,
}
unsafe impl DbValue for Pair {}

fn swap_pair(_db: &Database, bytes: &mut [u8]) {
    helios_data::swap::swap32(&mut bytes[0..4]);
    helios_data::swap::swap32(&mut bytes[4..8]);
}

fn execute_pair_job(db: &Database, job: Tag, _tls: Tls) -> helios_runtime::Result<i32> {
    let pair_tag = {
        let lease = db.access(job)?;
        *lease.get::<u32>()
    };

    // First access pulls the payload from the manager and byte-swaps it.
    let lease = db.access(pair_tag)?;
    let pair = *lease.get::<Pair>();
    drop(lease);
    if pair.number != 0x0102_0304 || pair.scalar != 1.5 {
        return Ok(-1);
    }

    // Send it back so the manager can verify the return path.
    db.dirt(pair_tag)?;
    Ok(JOB_OK)
}

/// Drives the server with a hand-rolled manager whose announced byte
/// order differs, so every payload is swapped once per hop.
#[test]
fn test_simulated_byteswap_round_trip() {
    let server_db = Arc::new(Database::new(0));
    builtin::register(&server_db);
    server_db.register_type(T_PAIR, TypeOps {
        name: "pair",
        atomic_size: 8,
        byteswap: Some(swap_pair),
        generate: None,
        execute: None,
    });
    server_db.register_type(T_PAIR_JOB, TypeOps {
        name: "pair_job",
        atomic_size: 0,
        byteswap: None,
        generate: None,
        execute: Some(execute_pair_job),
    });
    let (addr, _server) = spawn_server(server_db);

    // The manager pretends to be of the opposite byte order, and its
    // payload bytes really are foreign-endian.
    let foreign = match Endian::native() {
        Endian::Little => Endian::Big,
        Endian::Big => Endian::Little,
    };
    let mut pair_bytes = [0u8; 8];
    match foreign {
        Endian::Big => {
            pair_bytes[0..4].copy_from_slice(&0x0102_0304i32.to_be_bytes());
            pair_bytes[4..8].copy_from_slice(&1.5f32.to_be_bytes());
        }
        Endian::Little => {
            pair_bytes[0..4].copy_from_slice(&0x0102_0304i32.to_le_bytes());
            pair_bytes[4..8].copy_from_slice(&1.5f32.to_le_bytes());
        }
    }

    const PAIR_TAG: Tag = 100;
    const JOB_TAG: Tag = 101;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move {
            let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();

            write_message(
                &mut conn,
                &Message::HostAllocated(payload::HostAllocated {
                    checksum: PROTOCOL_CHECKSUM,
                    host: 1,
                    mgr_endian: foreign as u32,
                }),
            )
            .await
            .unwrap();
            let Message::HostAuthorized(auth) = read_message(&mut conn).await.unwrap() else {
                panic!("bad handshake");
            };
            assert_eq!(auth.need_byteswap, 1);

            write_message(
                &mut conn,
                &Message::CreateThreads(payload::CreateThreads { count: 1 }),
            )
            .await
            .unwrap();
            read_message(&mut conn).await.unwrap();

            // Announce the pair record and the job record.
            for (tag, type_code, size) in
                [(PAIR_TAG, T_PAIR, 8u32), (JOB_TAG, T_PAIR_JOB, 4u32)]
            {
                write_message(
                    &mut conn,
                    &Message::CreateData(payload::CreateData {
                        type_code,
                        size,
                        flags: 0,
                        tag,
                        host: 0,
                    }),
                )
                .await
                .unwrap();
                read_message(&mut conn).await.unwrap();
            }

            write_message(&mut conn, &Message::new_process_job(JOB_TAG)).await.unwrap();

            // Serve fetches until the job reports back.
            let mut announced = vec![];
            let result = loop {
                match read_message(&mut conn).await.unwrap() {
                    Message::SendData(p) => {
                        let job_payload = PAIR_TAG.to_le_bytes();
                        let bytes: &[u8] = if p.data == PAIR_TAG {
                            &pair_bytes
                        } else {
                            &job_payload
                        };
                        write_message(
                            &mut conn,
                            &Message::DataInfo(payload::DataInfo {
                                size: bytes.len() as u32,
                                inited: 1,
                            }),
                        )
                        .await
                        .unwrap();
                        write_blob(&mut conn, bytes).await.unwrap();
                    }
                    Message::DataGenerated(p) => announced.push(p.data),
                    Message::CheckAbort => {
                        write_message(&mut conn, &Message::new_is_aborted(false)).await.unwrap();
                    }
                    Message::JobFinished(p) => break p.result,
                    other => panic!("unexpected frame {other:?}"),
                }
            };
            assert_eq!(result, JOB_OK, "peer must observe the swapped values");
            assert!(announced.contains(&PAIR_TAG));

            // Pull the pair back; one more swap restores the original.
            write_message(&mut conn, &Message::new_send_data(PAIR_TAG, false)).await.unwrap();
            let Message::DataInfo(info) = read_message(&mut conn).await.unwrap() else {
                panic!("expected data_info");
            };
            let mut bytes = read_blob(&mut conn, info.size as usize).await.unwrap();
            swap_pair_slice(&mut bytes);
            assert_eq!(bytes, pair_bytes, "round trip must be byte-identical");

            write_message(&mut conn, &Message::Disconnect).await.unwrap();
            read_message(&mut conn).await.unwrap();
        });
}

fn swap_pair_slice(bytes: &mut [u8]) {
    helios_data::swap::swap32(&mut bytes[0..4]);
    helios_data::swap::swap32(&mut bytes[4..8]);
}

// ---- protocol robustness --------------------------------------------

#[test]
fn test_bad_handshake_is_fatal() {
    let server_db = Arc::new(Database::new(0));
    builtin::register(&server_db);
    let (addr, _server) = spawn_server(server_db);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move {
            let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
            write_message(
                &mut conn,
                &Message::HostAllocated(payload::HostAllocated {
                    checksum: 0xBAD,
                    host: 1,
                    mgr_endian: 0,
                }),
            )
            .await
            .unwrap();
            // The server drops the connection without authorizing.
            assert!(matches!(
                read_message(&mut conn).await,
                Err(Error::Io(_)) | Err(Error::ProtocolViolation(_))
            ));
        });
}

// Keep the shared DataMap in the loop too: the manager-side mirror of
// announced records behaves like a sparse tag map.
#[test]
fn test_datamap_mirror_of_headers() {
    let db = Database::new(0);
    builtin::register(&db);
    let mut mirror: DataMap<TypeCode> = DataMap::new();

    let (a, l) = db.create(builtin::TYPE_TABLE_BLOCK, 8, DB_FLUSHABLE).unwrap();
    drop(l);
    let (b, l) = db.create(builtin::TYPE_TAG, 4, 0).unwrap();
    drop(l);

    for (tag, code, _, _) in db.headers() {
        mirror.insert(tag, code);
    }
    assert_eq!(mirror.get(a), Some(&builtin::TYPE_TABLE_BLOCK));
    assert_eq!(mirror.get(b), Some(&builtin::TYPE_TAG));
}
