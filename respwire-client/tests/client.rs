use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use respwire_client::{
    Client, ClientConfig, ClientError, Command, ConnectionState, Dispatcher, ErrorKind,
    HandshakeStep, PushMessage, Reply,
};

type Handler = fn(usize, usize, Vec<Vec<u8>>, &mut TcpStream);

/// Accepts one connection per entry of `sessions`, each served on its own
/// thread. Session `n` reads `sessions[n]` commands, calling
/// `handler(n, idx, args, stream)` for each, then closes the socket.
fn spawn_server(sessions: &[usize], handler: Handler) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let sessions = sessions.to_vec();

    thread::spawn(move || {
        for (session, expected_commands) in sessions.into_iter().enumerate() {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            thread::spawn(move || serve(session, expected_commands, stream, handler));
        }
    });

    (addr.ip().to_string(), addr.port())
}

fn serve(session: usize, expected_commands: usize, mut stream: TcpStream, handler: Handler) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    for idx in 0..expected_commands {
        let Ok(args) = read_command(&mut reader) else {
            break;
        };
        handler(session, idx, args, &mut stream);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Serves one connection like `spawn_server`, then keeps reading and reports
/// `true` once the client closes its side.
fn spawn_watched_server(
    expected_commands: usize,
    handler: Handler,
) -> (String, u16, Receiver<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let Ok(args) = read_command(&mut reader) else {
                break;
            };
            handler(0, idx, args, &mut stream);
        }
        let mut scratch = [0u8; 64];
        loop {
            match reader.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => {
                    let _ = tx.send(false);
                    return;
                }
            }
        }
        let _ = tx.send(true);
    });

    (addr.ip().to_string(), addr.port(), rx)
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn write_raw(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(data);
    let _ = stream.flush();
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("+{msg}\r\n").as_bytes());
}

fn write_error(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("-{msg}\r\n").as_bytes());
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut frame = format!("${}\r\n", data.len()).into_bytes();
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    write_raw(stream, &frame);
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    write_raw(stream, format!(":{value}\r\n").as_bytes());
}

fn push_frame(parts: &[&str], count: Option<i64>) -> Vec<u8> {
    let len = parts.len() + usize::from(count.is_some());
    let mut frame = format!("*{len}\r\n");
    for part in parts {
        frame.push_str(&format!("${}\r\n{part}\r\n", part.len()));
    }
    if let Some(count) = count {
        frame.push_str(&format!(":{count}\r\n"));
    }
    frame.into_bytes()
}

fn config(host: String, port: u16) -> ClientConfig {
    let mut config = ClientConfig::new(host, port);
    config.connect_timeout = Some(Duration::from_secs(1));
    config.read_timeout = Some(Duration::from_secs(1));
    config.write_timeout = Some(Duration::from_secs(1));
    config.max_idle = 1;
    config.max_total = 1;
    config
}

fn dispatcher(host: String, port: u16) -> Dispatcher {
    Dispatcher::connect(config(host, port)).expect("connect")
}

fn bulk(data: &'static [u8]) -> Reply {
    Reply::Bulk(Some(Bytes::from_static(data)))
}

#[test]
fn call_roundtrip() {
    let (host, port) = spawn_server(&[2], |_, idx, args, stream| {
        if idx == 0 {
            assert_eq!(args, [b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
            write_simple(stream, "OK");
        } else {
            assert_eq!(args, [b"GET".to_vec(), b"key".to_vec()]);
            write_bulk(stream, b"value");
        }
    });

    let mut conn = dispatcher(host, port);
    let set = conn.call(&Command::new("SET").arg("key").arg("value")).expect("set");
    assert!(set.is_status(b"OK"));
    let get = conn.call(&Command::new("GET").arg("key")).expect("get");
    assert_eq!(get, bulk(b"value"));
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[test]
fn command_error_keeps_connection_usable() {
    let (host, port) = spawn_server(&[2], |_, idx, _, stream| {
        if idx == 0 {
            write_error(stream, "WRONGTYPE Operation against a key holding the wrong kind of value");
        } else {
            write_simple(stream, "PONG");
        }
    });

    let mut conn = dispatcher(host, port);
    let err = conn.call(&Command::new("INCR").arg("list")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    assert!(err
        .server_message()
        .expect("message")
        .starts_with(b"WRONGTYPE"));
    assert_eq!(conn.state(), ConnectionState::Ready);

    let pong = conn.call(&Command::new("PING")).expect("ping");
    assert!(pong.is_status(b"PONG"));
}

#[test]
fn pipeline_writes_everything_before_reading() {
    // Nothing is answered until the last command arrives.
    let (host, port) = spawn_server(&[5], |_, idx, _, stream| {
        if idx == 4 {
            write_raw(
                stream,
                b"+OK\r\n:5\r\n$-1\r\n-ERR unknown command\r\n*2\r\n$1\r\na\r\n*0\r\n",
            );
        }
    });

    let mut conn = dispatcher(host, port);
    let replies = conn
        .pipeline(&[
            Command::new("SET").arg("k").arg("v"),
            Command::new("INCRBY").arg("n").arg("5"),
            Command::new("GET").arg("missing"),
            Command::new("NOPE"),
            Command::new("LRANGE").arg("l").arg("0").arg("-1"),
        ])
        .expect("pipeline");

    assert_eq!(
        replies,
        vec![
            Reply::Simple(Bytes::from_static(b"OK")),
            Reply::Integer(5),
            Reply::Bulk(None),
            Reply::Error(Bytes::from_static(b"ERR unknown command")),
            Reply::Array(Some(vec![bulk(b"a"), Reply::Array(Some(vec![]))])),
        ]
    );
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(conn.pipeline(&[]).expect("empty").is_empty());
}

#[test]
fn transaction_returns_exec_results() {
    let (host, port) = spawn_server(&[4], |_, idx, args, stream| match idx {
        0 => {
            assert_eq!(args[0], b"MULTI");
            write_simple(stream, "OK");
        }
        1 | 2 => write_simple(stream, "QUEUED"),
        _ => {
            assert_eq!(args[0], b"EXEC");
            write_raw(stream, b"*2\r\n+OK\r\n:1\r\n");
        }
    });

    let mut conn = dispatcher(host, port);
    let results = conn
        .transaction(&[
            Command::new("SET").arg("k").arg("v"),
            Command::new("INCR").arg("n"),
        ])
        .expect("transaction");
    assert_eq!(
        results,
        Some(vec![Reply::Simple(Bytes::from_static(b"OK")), Reply::Integer(1)])
    );
}

#[test]
fn aborted_transaction_returns_none() {
    let (host, port) = spawn_server(&[3], |_, idx, _, stream| match idx {
        0 => write_simple(stream, "OK"),
        1 => write_simple(stream, "QUEUED"),
        _ => write_raw(stream, b"*-1\r\n"),
    });

    let mut conn = dispatcher(host, port);
    let results = conn
        .transaction(&[Command::new("GET").arg("watched")])
        .expect("transaction");
    assert_eq!(results, None);
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[test]
fn transaction_reports_queue_rejection() {
    let (host, port) = spawn_server(&[3], |_, idx, _, stream| match idx {
        0 => write_simple(stream, "OK"),
        1 => write_error(stream, "ERR unknown command 'NOPE'"),
        _ => write_error(stream, "EXECABORT Transaction discarded because of previous errors."),
    });

    let mut conn = dispatcher(host, port);
    let err = conn.transaction(&[Command::new("NOPE")]).unwrap_err();
    assert_eq!(err.server_message(), Some(&b"ERR unknown command 'NOPE'"[..]));
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[test]
fn handshake_runs_auth_select_setname_in_order() {
    let (host, port) = spawn_server(&[4], |_, idx, args, stream| {
        match idx {
            0 => assert_eq!(args, [b"AUTH".to_vec(), b"app".to_vec(), b"secret".to_vec()]),
            1 => assert_eq!(args, [b"SELECT".to_vec(), b"2".to_vec()]),
            2 => assert_eq!(
                args,
                [b"CLIENT".to_vec(), b"SETNAME".to_vec(), b"worker".to_vec()]
            ),
            _ => assert_eq!(args, [b"PING".to_vec()]),
        }
        let reply = if idx == 3 { "PONG" } else { "OK" };
        write_simple(stream, reply);
    });

    let mut config = config(host, port);
    config.username = Some("app".into());
    config.password = Some("secret".into());
    config.db = 2;
    config.client_name = Some("worker".into());

    let mut conn = Dispatcher::connect(config).expect("connect");
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(conn.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
}

#[test]
fn handshake_failure_names_the_step() {
    let (host, port) = spawn_server(&[2], |_, idx, _, stream| {
        if idx == 0 {
            write_simple(stream, "OK");
        } else {
            write_error(stream, "ERR DB index is out of range");
        }
    });

    let mut config = config(host, port);
    config.password = Some("secret".into());
    config.db = 99;

    let err = Dispatcher::connect(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    match err {
        ClientError::Handshake { step, source } => {
            assert_eq!(step, HandshakeStep::Select);
            assert_eq!(source.kind(), ErrorKind::Command);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn read_timeout_requires_explicit_reconnect() {
    let (host, port) = spawn_server(&[1, 1], |session, _, _, stream| {
        if session == 0 {
            thread::sleep(Duration::from_millis(800));
        } else {
            write_simple(stream, "PONG");
        }
    });

    let mut config = config(host, port);
    config.read_timeout = Some(Duration::from_millis(200));
    config.reconnect_attempts = 0;
    let mut conn = Dispatcher::connect(config).expect("connect");

    let err = conn.call(&Command::new("GET").arg("slow")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let err = conn.call(&Command::new("PING")).unwrap_err();
    assert!(matches!(err, ClientError::State { state: ConnectionState::Disconnected, .. }));

    conn.reconnect().expect("reconnect");
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(conn.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
}

#[test]
fn single_command_is_retried_once_after_disconnect() {
    let (host, port) = spawn_server(&[1, 1], |session, _, args, stream| {
        assert_eq!(args[0], b"GET");
        if session == 1 {
            write_bulk(stream, b"value");
        }
    });

    let mut conn = dispatcher(host, port);
    let reply = conn.call(&Command::new("GET").arg("key")).expect("retried get");
    assert_eq!(reply, bulk(b"value"));
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[test]
fn failed_retry_reports_both_errors() {
    let (host, port) = spawn_server(&[1, 1], |_, _, _, _| {});

    let mut conn = dispatcher(host, port);
    let err = conn.call(&Command::new("PING")).unwrap_err();
    match &err {
        ClientError::ReconnectFailed { original, retry } => {
            assert_eq!(original.kind(), ErrorKind::Connection);
            assert_eq!(retry.kind(), ErrorKind::Connection);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn partially_answered_pipeline_is_not_retried() {
    let (host, port) = spawn_server(&[2, 2], |session, idx, _, stream| {
        assert_eq!(session, 0, "pipeline must not be resent");
        if idx == 0 {
            write_simple(stream, "OK");
        }
    });

    let mut conn = dispatcher(host, port);
    let err = conn
        .pipeline(&[Command::new("SET").arg("a").arg("1"), Command::new("INCR").arg("a")])
        .unwrap_err();
    match &err {
        ClientError::PipelineRead {
            received,
            total,
            source,
        } => {
            assert_eq!((*received, *total), (1, 2));
            assert!(matches!(**source, ClientError::Connection { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn push_mode_commands_are_refused_by_call() {
    let (host, port) = spawn_server(&[1], |_, _, args, stream| {
        assert_eq!(args[0], b"PING");
        write_simple(stream, "PONG");
    });

    let mut conn = dispatcher(host, port);
    for cmd in [Command::new("SUBSCRIBE").arg("ch"), Command::new("monitor")] {
        let err = conn.call(&cmd).unwrap_err();
        assert!(matches!(err, ClientError::InvalidCommand(_)));
        assert_eq!(err.kind(), ErrorKind::State);
    }
    let err = conn
        .pipeline(&[Command::new("PING"), Command::new("PSUBSCRIBE").arg("p*")])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    assert!(conn.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
}

#[test]
fn subscribe_receive_unsubscribe_then_resume_commands() {
    let (host, port) = spawn_server(&[3], |_, idx, args, stream| match idx {
        0 => {
            assert_eq!(args, [b"SUBSCRIBE".to_vec(), b"news".to_vec()]);
            write_raw(stream, &push_frame(&["subscribe", "news"], Some(1)));
            write_raw(stream, &push_frame(&["message", "news", "hello"], None));
        }
        1 => {
            assert_eq!(args, [b"UNSUBSCRIBE".to_vec()]);
            write_raw(stream, &push_frame(&["unsubscribe", "news"], Some(0)));
        }
        _ => write_simple(stream, "PONG"),
    });

    let conn = dispatcher(host, port);
    let mut subscriber = conn.subscribe(["news"]).expect("subscribe");
    assert_eq!(subscriber.state(), ConnectionState::Subscribed);
    assert_eq!(subscriber.channels().collect::<Vec<_>>(), [&b"news"[..]]);

    let message = subscriber.next_message().expect("message");
    assert_eq!(
        message,
        PushMessage::Message {
            channel: Bytes::from_static(b"news"),
            payload: Bytes::from_static(b"hello"),
        }
    );

    subscriber.unsubscribe(Vec::<&str>::new()).expect("unsubscribe");
    assert_eq!(subscriber.state(), ConnectionState::Ready);
    assert_eq!(subscriber.channels().count(), 0);
    assert!(subscriber.messages().next().is_none());

    let mut conn = subscriber.into_dispatcher().expect("back to commands");
    assert!(conn.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
}

#[test]
fn messages_between_confirmations_are_queued() {
    let (host, port) = spawn_server(&[1], |_, _, args, stream| {
        assert_eq!(args[0], b"PSUBSCRIBE");
        let mut frames = push_frame(&["psubscribe", "a*"], Some(1));
        frames.extend(push_frame(&["pmessage", "a*", "alpha", "early"], None));
        frames.extend(push_frame(&["psubscribe", "b*"], Some(2)));
        write_raw(stream, &frames);
    });

    let conn = dispatcher(host, port);
    let mut subscriber = conn.psubscribe(["a*", "b*"]).expect("psubscribe");
    assert_eq!(subscriber.patterns().count(), 2);

    let message = subscriber.next_message().expect("queued message");
    assert_eq!(
        message,
        PushMessage::PMessage {
            pattern: Bytes::from_static(b"a*"),
            channel: Bytes::from_static(b"alpha"),
            payload: Bytes::from_static(b"early"),
        }
    );
}

#[test]
fn monitor_streams_lines() {
    let (host, port) = spawn_server(&[1], |_, _, args, stream| {
        assert_eq!(args, [b"MONITOR".to_vec()]);
        write_simple(stream, "OK");
        write_simple(stream, "1700000000.000001 [0 127.0.0.1:5000] \"SET\" \"k\" \"v\"");
        write_simple(stream, "1700000000.000002 [0 127.0.0.1:5000] \"GET\" \"k\"");
    });

    let conn = dispatcher(host, port);
    let mut monitor = conn.monitor().expect("monitor");
    assert_eq!(monitor.state(), ConnectionState::Monitoring);

    let first = monitor.next_line().expect("first line");
    assert!(first.ends_with(b"\"SET\" \"k\" \"v\""));
    let second = monitor.next().expect("second line").expect("line");
    assert!(second.ends_with(b"\"GET\" \"k\""));
    monitor.close();
}

#[test]
fn close_handle_unblocks_pending_read() {
    let (host, port) = spawn_server(&[1], |_, _, _, _| {
        thread::sleep(Duration::from_secs(2));
    });

    let mut config = config(host, port);
    config.read_timeout = None;
    config.reconnect_attempts = 0;
    let mut conn = Dispatcher::connect(config).expect("connect");

    let handle = conn.close_handle().expect("handle");
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.close();
    });

    let started = Instant::now();
    let err = conn.call(&Command::new("BLPOP").arg("q").arg("0")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    closer.join().expect("closer");
}

#[test]
fn pool_discards_broken_connections() {
    let (host, port) = spawn_server(&[2, 1], |session, idx, args, stream| {
        if session == 0 && idx == 1 {
            assert_eq!(args[0], b"GET");
            return;
        }
        write_simple(stream, "PONG");
    });

    let mut config = config(host, port);
    config.reconnect_attempts = 0;
    let client = Client::with_config(config).expect("client");

    assert!(client.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
    assert_eq!(client.pool().counts(), (1, 1));

    let held = client.acquire().expect("acquire");
    assert!(matches!(
        client.call(&Command::new("PING")),
        Err(ClientError::PoolExhausted)
    ));
    drop(held);

    let err = client.call(&Command::new("GET").arg("k")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(client.pool().counts(), (0, 0));

    assert!(client.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
    assert_eq!(client.pool().counts(), (1, 1));
}

#[test]
fn integer_replies_pass_through_call() {
    let (host, port) = spawn_server(&[1], |_, _, _, stream| {
        write_integer(stream, -2);
    });

    let mut conn = dispatcher(host, port);
    let ttl = conn.call(&Command::new("TTL").arg("missing")).expect("ttl");
    assert_eq!(ttl.as_integer(), Some(-2));
}

#[test]
fn malformed_reply_is_a_protocol_error() {
    let (host, port) = spawn_server(&[1], |_, _, _, stream| {
        write_raw(stream, b"?garbage\r\n");
    });

    let mut conn = dispatcher(host, port);
    let err = conn.call(&Command::new("PING")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(matches!(err, ClientError::Protocol(_)), "got {err:?}");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn stalled_pipeline_write_reports_flushed_commands() {
    // The server takes the first command and then stops reading.
    let (host, port) = spawn_server(&[1], |_, _, _, _| {
        thread::sleep(Duration::from_secs(2));
    });

    let mut config = config(host, port);
    config.write_timeout = Some(Duration::from_millis(200));
    config.reconnect_attempts = 0;
    let mut conn = Dispatcher::connect(config).expect("connect");

    let payload = vec![b'x'; 32 * 1024 * 1024];
    let err = conn
        .pipeline(&[
            Command::new("SET").arg("a").arg("1"),
            Command::new("SET").arg("big").arg(&payload),
            Command::new("PING"),
        ])
        .unwrap_err();
    match &err {
        ClientError::PipelineWrite {
            flushed,
            total,
            source,
        } => {
            assert_eq!((*flushed, *total), (1, 3));
            assert_eq!(source.kind(), ErrorKind::Timeout);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn command_after_multi_is_not_retried_on_a_fresh_connection() {
    for opener in [&["MULTI"][..], &["WATCH", "k"][..]] {
        let (host, port) = spawn_server(&[2, 1], |session, idx, _, stream| {
            // Session 0 drops the socket on the second command; session 1
            // would accept a resent command outside the transaction.
            if session == 1 || idx == 0 {
                write_simple(stream, "OK");
            }
        });

        let mut conn = dispatcher(host, port);
        conn.call(&Command::from_args(opener)).expect("open transaction");
        assert!(conn.in_transaction());

        let err = conn.call(&Command::new("SET").arg("k").arg("v")).unwrap_err();
        assert!(matches!(err, ClientError::Connection { .. }), "got {err:?}");
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.reconnect().expect("reconnect");
        assert!(!conn.in_transaction());
        assert!(conn.call(&Command::new("PING")).expect("ping").is_status(b"OK"));
    }
}

#[test]
fn pool_discards_connection_left_inside_multi() {
    let (host, port) = spawn_server(&[1, 1], |session, _, _, stream| {
        let reply = if session == 0 { "OK" } else { "PONG" };
        write_simple(stream, reply);
    });

    let client = Client::with_config(config(host, port)).expect("client");
    {
        let mut conn = client.acquire().expect("acquire");
        conn.call(&Command::new("MULTI")).expect("multi");
    }
    assert_eq!(client.pool().counts(), (0, 0));

    assert!(client.call(&Command::new("PING")).expect("ping").is_status(b"PONG"));
}

#[test]
fn idle_subscriber_outlives_read_timeout() {
    let (host, port) = spawn_server(&[3], |_, idx, _, stream| match idx {
        0 => {
            write_raw(stream, &push_frame(&["subscribe", "quiet"], Some(1)));
            thread::sleep(Duration::from_millis(600));
            write_raw(stream, &push_frame(&["message", "quiet", "finally"], None));
        }
        1 => write_raw(stream, &push_frame(&["unsubscribe", "quiet"], Some(0))),
        _ => thread::sleep(Duration::from_millis(600)),
    });

    let mut config = config(host, port);
    config.read_timeout = Some(Duration::from_millis(200));
    config.reconnect_attempts = 0;
    let conn = Dispatcher::connect(config).expect("connect");

    let mut subscriber = conn.subscribe(["quiet"]).expect("subscribe");
    let message = subscriber.next_message().expect("message after idle period");
    assert_eq!(
        message,
        PushMessage::Message {
            channel: Bytes::from_static(b"quiet"),
            payload: Bytes::from_static(b"finally"),
        }
    );
    assert_eq!(subscriber.state(), ConnectionState::Subscribed);

    // Back in request/reply mode the deadline applies again.
    subscriber.unsubscribe(["quiet"]).expect("unsubscribe");
    let mut conn = subscriber.into_dispatcher().expect("back to commands");
    let err = conn.call(&Command::new("GET").arg("k")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn idle_monitor_outlives_read_timeout() {
    let (host, port) = spawn_server(&[1], |_, _, _, stream| {
        write_simple(stream, "OK");
        thread::sleep(Duration::from_millis(600));
        write_simple(stream, "1700000000.000001 [0 127.0.0.1:5000] \"PING\"");
    });

    let mut config = config(host, port);
    config.read_timeout = Some(Duration::from_millis(200));
    let conn = Dispatcher::connect(config).expect("connect");

    let mut monitor = conn.monitor().expect("monitor");
    let line = monitor.next_line().expect("line after idle period");
    assert!(line.ends_with(b"\"PING\""));
    assert_eq!(monitor.state(), ConnectionState::Monitoring);
}

#[test]
fn dropping_subscriber_closes_socket() {
    let (host, port, closed) = spawn_watched_server(1, |_, _, _, stream| {
        write_raw(stream, &push_frame(&["subscribe", "news"], Some(1)));
    });

    let subscriber = dispatcher(host, port).subscribe(["news"]).expect("subscribe");
    drop(subscriber);
    assert_eq!(closed.recv_timeout(Duration::from_secs(1)), Ok(true));
}

#[test]
fn closing_monitor_closes_socket() {
    let (host, port, closed) = spawn_watched_server(1, |_, _, _, stream| {
        write_simple(stream, "OK");
    });

    let monitor = dispatcher(host, port).monitor().expect("monitor");
    monitor.close();
    assert_eq!(closed.recv_timeout(Duration::from_secs(1)), Ok(true));
}

#[test]
fn large_array_reply_arrives_in_chunks() {
    let (host, port) = spawn_server(&[1], |_, _, _, stream| {
        let count = 20_000;
        let mut frame = format!("*{count}\r\n").into_bytes();
        for idx in 0..count {
            let item = format!("member:{idx}");
            frame.extend_from_slice(format!("${}\r\n{item}\r\n", item.len()).as_bytes());
        }
        for chunk in frame.chunks(1024) {
            write_raw(stream, chunk);
        }
    });

    let mut conn = dispatcher(host, port);
    let reply = conn.call(&Command::new("SMEMBERS").arg("big")).expect("smembers");
    let items = reply.into_array().expect("array");
    assert_eq!(items.len(), 20_000);
    assert_eq!(items[19_999], Reply::Bulk(Some(Bytes::from("member:19999"))));
    assert_eq!(conn.state(), ConnectionState::Ready);
}
