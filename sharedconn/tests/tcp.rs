use sharedconn::{Connection, SharedConn};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn read_until_eof(mut reader: impl Read) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    out
}

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";

#[test]
fn request_method_is_delivered_once() {
    init_logging();
    let (mut client, server) = tcp_pair();
    client.write_all(REQUEST).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (mut conn, mut inspector) = SharedConn::new(server);
    let mut method = [0u8; 3];
    inspector.read_exact(&mut method).unwrap();
    assert_eq!(&method, b"GET");

    let mut buf = [0u8; 1024];
    assert_eq!(conn.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"GET");

    let rest = read_until_eof(&mut conn);
    assert_eq!(rest, &REQUEST[3..]);
}

#[test]
fn inspected_prefix_plus_live_bytes_rebuild_the_stream() {
    init_logging();
    for peek_len in [1, 7, REQUEST.len() - 1, REQUEST.len()] {
        let (mut client, server) = tcp_pair();
        client.write_all(REQUEST).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let (conn, mut inspector) = SharedConn::new(server);
        let mut peeked = vec![0u8; peek_len];
        inspector.read_exact(&mut peeked).unwrap();
        assert_eq!(conn.buffered(), peek_len);

        assert_eq!(read_until_eof(&conn), REQUEST, "peeked {} bytes", peek_len);
        assert!(conn.is_live());
    }
}

#[test]
fn uninspected_connection_reads_like_the_raw_one() {
    let (mut client, server) = tcp_pair();
    client.write_all(REQUEST).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (conn, _inspector) = SharedConn::new(server);
    assert_eq!(read_until_eof(&conn), REQUEST);
}

#[test]
fn peer_close_is_reported_after_the_replay() {
    init_logging();
    let (mut client, server) = tcp_pair();
    client.write_all(b"\x16\x03\x01\x02\x00").unwrap();
    drop(client);

    let (conn, mut inspector) = SharedConn::new(server);
    let mut hello = [0u8; 5];
    inspector.read_exact(&mut hello).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(conn.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], &hello);
    assert!(!conn.is_live());

    assert_eq!(conn.read(&mut buf).unwrap(), 0);
    assert!(conn.is_live());
}

#[test]
fn concurrent_readers_partition_the_stream() {
    init_logging();
    // Every byte value is unique, so any overlap or gap shows up.
    let payload: Vec<u8> = (0..=249).collect();
    let (mut client, server) = tcp_pair();
    client.write_all(&payload).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (conn, mut inspector) = SharedConn::new(server);
    let mut peeked = [0u8; 10];
    inspector.read_exact(&mut peeked).unwrap();

    let conn = Arc::new(conn);
    let start = Arc::new(Barrier::new(2));
    let readers: Vec<_> = [3usize, 5]
        .into_iter()
        .map(|chunk| {
            let conn = conn.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut chunks = Vec::new();
                let mut buf = vec![0u8; chunk];
                loop {
                    let n = (&*conn).read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    chunks.push(buf[..n].to_vec());
                }
                chunks
            })
        })
        .collect();

    let mut chunks: Vec<Vec<u8>> = readers
        .into_iter()
        .flat_map(|r| r.join().unwrap())
        .collect();

    for chunk in &chunks {
        assert!(
            chunk.windows(2).all(|w| w[1] == w[0] + 1),
            "chunk is not a contiguous slice of the stream: {:?}",
            chunk
        );
    }
    chunks.sort_by_key(|c| c[0]);
    assert_eq!(chunks.concat(), payload);
}

#[test]
fn writes_proceed_while_a_read_is_blocked() {
    let (mut client, server) = tcp_pair();
    let (conn, _inspector) = SharedConn::new(server);
    let conn = Arc::new(conn);

    let reader = {
        let conn = conn.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let n = (&*conn).read(&mut buf).unwrap();
            buf[..n].to_vec()
        })
    };

    thread::sleep(Duration::from_millis(50));
    (&*conn).write_all(b"220 ready\r\n").unwrap();

    let mut greeting = [0u8; 11];
    client.read_exact(&mut greeting).unwrap();
    assert_eq!(&greeting, b"220 ready\r\n");

    client.write_all(b"EHLO").unwrap();
    assert_eq!(reader.join().unwrap(), b"EHLO");
}

#[test]
fn close_unblocks_a_pending_read() {
    let (_client, server) = tcp_pair();
    let (conn, _inspector) = SharedConn::new(server);
    let conn = Arc::new(conn);

    let reader = {
        let conn = conn.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            conn.read(&mut buf)
        })
    };

    thread::sleep(Duration::from_millis(50));
    conn.close().unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), 0);
}

#[test]
fn read_timeout_passes_through() {
    let (client, server) = tcp_pair();
    let (conn, mut inspector) = SharedConn::new(server);
    conn.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

    let mut buf = [0u8; 8];
    let err = inspector.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    let err = conn.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
    assert!(conn.is_live());

    assert_eq!(conn.peer_addr().unwrap(), client.local_addr().unwrap());
}

#[cfg(unix)]
#[test]
fn works_over_unix_sockets() {
    use std::os::unix::net::UnixStream;

    let (mut client, server) = UnixStream::pair().unwrap();
    client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let (conn, mut inspector) = SharedConn::with_capacity(server, 4);
    let mut banner = [0u8; 8];
    inspector.read_exact(&mut banner).unwrap();
    assert_eq!(&banner, b"SSH-2.0-");

    assert_eq!(read_until_eof(&conn), b"SSH-2.0-OpenSSH_9.6\r\n");
}
