//! End-to-end tests of the server runtime over the static back-end.

mod support;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sward_9p::staticfs::{
    open_bytes, open_string, Buffer, Entry, File, Params, StaticFid, StaticFsys,
};
use sward_protocol::{Fcall, OpenMode, DMDIR, NOTAG, VERSION_9P2000};

use support::Client;

fn demo_fs() -> Arc<StaticFsys<(), Vec<u8>>> {
    Arc::new(
        StaticFsys::new(Params {
            root: BTreeMap::from([
                ("foo".to_owned(), Entry::file(b"bar".to_vec())),
                (
                    "info".to_owned(),
                    Entry::dir([
                        ("version".to_owned(), Entry::file(b"something new".to_vec())),
                        ("other".to_owned(), Entry::file(vec![b'a'; 1024 * 1024])),
                    ]),
                ),
            ]),
            opener: Box::new(|f: &StaticFid<(), Vec<u8>>| Ok(open_bytes(f.content().clone()))),
            context_for_attach: Some(Box::new(|_, _| Ok(()))),
            uid: None,
            gid: None,
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn simple_read() {
    let mut c = Client::start(demo_fs()).await;
    let qid = c.attach(0, "rog", "").await.unwrap();
    assert!(qid.is_dir());
    c.open_path(0, 1, &["foo"], OpenMode::OREAD).await.unwrap();
    assert_eq!(c.read_all(1).await.unwrap(), b"bar");
    c.clunk(1).await.unwrap();
    c.clunk(0).await.unwrap();
}

#[tokio::test]
async fn directory_listing() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.open_path(0, 1, &["info"], OpenMode::OREAD).await.unwrap();
    let entries = c.dirread_all(1).await.unwrap();
    assert_eq!(entries.len(), 2);
    // Children are listed in name order with the qid paths their
    // construction order assigned.
    assert_eq!(entries[0].name, "other");
    assert_eq!(entries[0].qid.path, 4);
    assert_eq!(entries[0].mode, 0o444);
    assert_eq!(entries[0].uid, "noone");
    assert_eq!(entries[0].gid, "noone");
    assert!(!entries[0].qid.is_dir());
    assert_eq!(entries[1].name, "version");
    assert_eq!(entries[1].qid.path, 5);
    assert_eq!(entries[1].mode, 0o444);
    assert_eq!(entries[1].uid, "noone");
    assert_eq!(entries[1].gid, "noone");
}

#[tokio::test]
async fn deep_walk() {
    let mut entry = Entry::dir(BTreeMap::<String, Entry<String>>::new());
    for k in (0..48).rev() {
        entry = Entry::dir([(format!("dir{}", k), entry)]);
    }
    let root = match entry {
        Entry::Dir { entries } => entries,
        Entry::File { .. } => unreachable!(),
    };
    let fs = Arc::new(
        StaticFsys::new(Params {
            root,
            opener: Box::new(|f: &StaticFid<(), String>| Ok(open_string(f.content().clone()))),
            context_for_attach: Some(Box::new(|_, _| Ok(()))),
            uid: None,
            gid: None,
        })
        .unwrap(),
    );
    let mut c = Client::start(fs).await;
    c.attach(0, "rog", "").await.unwrap();
    for k in 0..48 {
        let name = format!("dir{}", k);
        let qids = c.walk(0, 0, &[&name]).await.unwrap();
        assert_eq!(qids.len(), 1);
        let dir = c.stat(0).await.unwrap();
        assert_eq!(dir.name, name);
        assert_eq!(dir.mode, DMDIR | 0o555);
        assert_eq!(dir.uid, "noone");
        assert_eq!(dir.gid, "noone");
        assert!(dir.qid.is_dir());
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Foo,
    InfoVersion,
    InfoOther,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Foo => write!(f, "foo content"),
            Kind::InfoVersion => write!(f, "version content"),
            Kind::InfoOther => write!(f, "other content"),
        }
    }
}

#[derive(Clone)]
struct AttachData {
    aname: String,
    other: Buffer,
}

fn threaded_fs() -> Arc<StaticFsys<AttachData, Kind>> {
    Arc::new(
        StaticFsys::new(Params {
            root: BTreeMap::from([
                ("foo".to_owned(), Entry::file(Kind::Foo)),
                (
                    "info".to_owned(),
                    Entry::dir([
                        ("version".to_owned(), Entry::file(Kind::InfoVersion)),
                        ("other".to_owned(), Entry::file(Kind::InfoOther)),
                    ]),
                ),
            ]),
            opener: Box::new(|f: &StaticFid<AttachData, Kind>| {
                let c = f.context();
                match f.content() {
                    Kind::InfoOther => Ok(Box::new(c.other.clone()) as Box<dyn File>),
                    kind => Ok(open_string(format!("aname={:?} {}", c.aname, kind))),
                }
            }),
            context_for_attach: Some(Box::new(|_uname, aname| {
                Ok(AttachData {
                    aname: aname.to_owned(),
                    other: Buffer::new(1024),
                })
            })),
            uid: None,
            gid: None,
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn per_attach_context_and_writable_buffer() {
    let mut c = Client::start(threaded_fs()).await;
    c.attach(0, "rog", "xxx").await.unwrap();

    // The opener sees the attach context.
    c.open_path(0, 1, &["foo"], OpenMode::OREAD).await.unwrap();
    assert_eq!(c.read_all(1).await.unwrap(), b"aname=\"xxx\" foo content");
    c.clunk(1).await.unwrap();

    // The buffer file is writable and keeps its contents across opens
    // within the same attach.
    c.open_path(0, 2, &["info", "other"], OpenMode::ORDWR)
        .await
        .unwrap();
    assert_eq!(c.read_all(2).await.unwrap(), b"");
    assert_eq!(c.write(2, 0, b"some content").await.unwrap(), 12);
    assert_eq!(c.read_all(2).await.unwrap(), b"some content");
    c.clunk(2).await.unwrap();

    c.open_path(0, 2, &["info", "other"], OpenMode::ORDWR)
        .await
        .unwrap();
    assert_eq!(c.read_all(2).await.unwrap(), b"some content");
    c.clunk(2).await.unwrap();

    // A different attach gets a different buffer.
    c.attach(10, "rog", "yyy").await.unwrap();
    c.open_path(10, 11, &["info", "other"], OpenMode::OREAD)
        .await
        .unwrap();
    assert_eq!(c.read_all(11).await.unwrap(), b"");
}

#[tokio::test]
async fn unknown_version_is_refused() {
    let mut c = Client::connect(demo_fs());
    let reply = c
        .rpc_tag(
            NOTAG,
            Fcall::Tversion {
                msize: support::MSIZE,
                version: "9P2021".to_owned(),
            },
        )
        .await;
    match reply {
        Fcall::Rversion { version, .. } => assert_eq!(version, "unknown"),
        other => panic!("unexpected reply: {:?}", other),
    }
    // The server hangs up after refusing the version.
    assert!(c.recv_eof().await.is_none());
}

#[tokio::test]
async fn first_message_must_be_version() {
    let mut c = Client::connect(demo_fs());
    c.send(
        1,
        Fcall::Tattach {
            fid: 0,
            afid: sward_protocol::NOFID,
            uname: "rog".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    assert!(c.recv_eof().await.is_none());
}

#[tokio::test]
async fn version_echoes_msize() {
    let mut c = Client::connect(demo_fs());
    let reply = c
        .rpc_tag(
            NOTAG,
            Fcall::Tversion {
                msize: 12345,
                version: VERSION_9P2000.to_owned(),
            },
        )
        .await;
    assert_eq!(
        reply,
        Fcall::Rversion {
            msize: 12345,
            version: VERSION_9P2000.to_owned(),
        }
    );
}

#[tokio::test]
async fn partial_walk_truncates_and_drops_new_fid() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    // "info" resolves, "nope" fails at the second element.
    let qids = c.walk(0, 1, &["info", "nope", "version"]).await.unwrap();
    assert_eq!(qids.len(), 1);
    assert!(qids[0].is_dir());
    // The new fid was not created.
    assert_eq!(c.clunk(1).await.unwrap_err(), "fid 1 not found");
    // A walk that fails on its first element is an error reply.
    assert_eq!(c.walk(0, 1, &["nope"]).await.unwrap_err(), "file not found");
    assert_eq!(c.clunk(1).await.unwrap_err(), "fid 1 not found");
    // The source fid is still usable.
    c.open_path(0, 1, &["foo"], OpenMode::OREAD).await.unwrap();
}

#[tokio::test]
async fn inplace_walk_failure_leaves_fid() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.walk(0, 1, &[]).await.unwrap();
    let qids = c.walk(1, 1, &["info", "nope"]).await.unwrap();
    assert_eq!(qids.len(), 1);
    // The fid did not move.
    let dir = c.stat(1).await.unwrap();
    assert_eq!(dir.name, ".");
    // It can still walk to a real child in place.
    c.walk(1, 1, &["info", "version"]).await.unwrap();
    assert_eq!(c.stat(1).await.unwrap().name, "version");
}

#[tokio::test]
async fn fid_lifecycle_errors() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    assert_eq!(
        c.attach(0, "rog", "").await.unwrap_err(),
        "fid 0 already in use"
    );
    assert_eq!(
        c.read(99, 0, 16).await.unwrap_err(),
        "fid 99 not found"
    );
    c.walk(0, 1, &["foo"]).await.unwrap();
    assert_eq!(
        c.read(1, 0, 16).await.unwrap_err(),
        "fid must be opened first"
    );
    c.open(1, OpenMode::OREAD).await.unwrap();
    assert_eq!(
        c.open(1, OpenMode::OREAD).await.unwrap_err(),
        "fid is already open"
    );
    assert_eq!(
        c.walk(1, 2, &["x"]).await.unwrap_err(),
        "operation not allowed on open fid"
    );
    c.clunk(1).await.unwrap();
    assert_eq!(c.clunk(1).await.unwrap_err(), "fid 1 not found");
}

#[tokio::test]
async fn mode_checks() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    // Reading a write-only fid is refused by the runtime.
    c.open_path(0, 1, &["foo"], OpenMode::OWRITE).await.unwrap();
    assert_eq!(c.read(1, 0, 16).await.unwrap_err(), "permission denied");
    // The read-only file refuses the write itself.
    assert_eq!(c.write(1, 0, b"x").await.unwrap_err(), "read-only file");
    // Writing a read-only fid is refused by the runtime.
    c.open_path(0, 2, &["foo"], OpenMode::OREAD).await.unwrap();
    assert_eq!(c.write(2, 0, b"x").await.unwrap_err(), "permission denied");
    // Directories cannot be opened for writing or exec.
    for mode in [OpenMode::OWRITE, OpenMode::ORDWR, OpenMode::OEXEC] {
        c.walk(0, 3, &["info"]).await.unwrap();
        assert_eq!(c.open(3, mode).await.unwrap_err(), "permission denied");
        c.clunk(3).await.unwrap();
    }
}

#[tokio::test]
async fn directory_read_offsets() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.open_path(0, 1, &["info"], OpenMode::OREAD).await.unwrap();
    let chunk = c.read(1, 0, 4096).await.unwrap();
    assert!(!chunk.is_empty());
    // Directories cannot be seeked except back to zero.
    let err = c.read(1, 1, 4096).await.unwrap_err();
    assert!(
        err.starts_with("illegal read offset in directory"),
        "unexpected error: {}",
        err
    );
    // The running offset continues the read; the end returns no data.
    let rest = c.read(1, chunk.len() as u64, 4096).await.unwrap();
    assert!(rest.is_empty());
    // Offset zero restarts the listing.
    let again = c.read(1, 0, 4096).await.unwrap();
    assert_eq!(again, chunk);
}

#[tokio::test]
async fn directory_read_count_too_small() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.open_path(0, 1, &["info"], OpenMode::OREAD).await.unwrap();
    assert_eq!(
        c.read(1, 0, 5).await.unwrap_err(),
        "directory read count too small for directory entry"
    );
}

#[tokio::test]
async fn stat_is_idempotent() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.walk(0, 1, &["info", "version"]).await.unwrap();
    let a = c.stat(1).await.unwrap();
    let b = c.stat(1).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.name, "version");
    assert_eq!(a.qid.path, 5);
}

#[tokio::test]
async fn remove_is_denied_but_clunks() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.walk(0, 1, &["foo"]).await.unwrap();
    assert_eq!(c.remove(1).await.unwrap_err(), "permission denied");
    // The fid is gone regardless of the failure.
    assert_eq!(c.clunk(1).await.unwrap_err(), "fid 1 not found");
}

#[tokio::test]
async fn flush_of_idle_tag_replies() {
    let mut c = Client::start(demo_fs()).await;
    c.flush(1234).await.unwrap();
}

#[tokio::test]
async fn auth_is_not_implemented() {
    let mut c = Client::start(demo_fs()).await;
    let err = c
        .rpc(Fcall::Tauth {
            afid: 5,
            uname: "rog".to_owned(),
            aname: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, "operation not implemented");
    // The failed auth released its fid.
    c.attach(5, "rog", "").await.unwrap();
}

#[tokio::test]
async fn create_has_no_handler() {
    let mut c = Client::start(demo_fs()).await;
    let err = c
        .rpc(Fcall::Tcreate {
            fid: 0,
            name: "new".to_owned(),
            perm: 0o644,
            mode: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err, "bad operation type");
}

#[tokio::test]
async fn interleaved_requests_on_distinct_fids() {
    let mut c = Client::start(demo_fs()).await;
    c.attach(0, "rog", "").await.unwrap();
    c.open_path(0, 1, &["foo"], OpenMode::OREAD).await.unwrap();
    c.open_path(0, 2, &["info", "version"], OpenMode::OREAD)
        .await
        .unwrap();
    // Two reads in flight at once; replies may arrive in either order.
    c.send(
        100,
        Fcall::Tread {
            fid: 1,
            offset: 0,
            count: 64,
        },
    )
    .await;
    c.send(
        101,
        Fcall::Tread {
            fid: 2,
            offset: 0,
            count: 64,
        },
    )
    .await;
    let mut replies = std::collections::HashMap::new();
    for _ in 0..2 {
        let (tag, fc) = c.recv().await;
        match fc {
            Fcall::Rread { data } => {
                replies.insert(tag, data);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
    assert_eq!(replies[&100], &b"bar"[..]);
    assert_eq!(replies[&101], &b"something new"[..]);
}

#[cfg(unix)]
#[tokio::test]
async fn serves_on_unix_socket() {
    use std::time::Duration;
    use tokio::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test9p");
    let fs = demo_fs();
    let logger = Arc::new(sward_9p::logger::NullLogger)
        as Arc<dyn sward_9p::logger::Logger + Send + Sync>;
    let sock = path.clone();
    let listener = tokio::spawn(async move {
        let _ = sward_9p::listen::serve_unix(logger, fs, sock).await;
    });
    let stream = loop {
        match UnixStream::connect(&path).await {
            Ok(s) => break s,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    let mut c = Client::from_stream(stream);
    c.handshake().await;
    c.attach(0, "rog", "").await.unwrap();
    c.open_path(0, 1, &["foo"], OpenMode::OREAD).await.unwrap();
    assert_eq!(c.read_all(1).await.unwrap(), b"bar");
    listener.abort();
}
