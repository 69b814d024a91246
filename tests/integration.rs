use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;
use virtmux::{
    Codec, Config, ConfigBuilder, ErrorCode, Frame, FrameType, MuxError, Session, StreamId,
};

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

type RawPeer = Framed<DuplexStream, Codec>;

async fn session_pair(config: Config) -> (Session, Session) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Session::client(a, config.clone()).await.unwrap();
    let server = Session::server(b, config).await.unwrap();
    (client, server)
}

/// A server session whose peer speaks raw frames.
async fn server_with_raw_peer(config: Config) -> (Session, RawPeer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let peer = Framed::new(a, Codec::new(&config));
    let session = Session::server(b, config).await.unwrap();
    (session, peer)
}

/// A client session whose peer speaks raw frames.
async fn client_with_raw_peer(config: Config) -> (Session, RawPeer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let peer = Framed::new(a, Codec::new(&config));
    let session = Session::client(b, config).await.unwrap();
    (session, peer)
}

async fn next_frame(peer: &mut RawPeer) -> Frame {
    peer.next()
        .await
        .expect("transport closed")
        .expect("malformed frame")
}

fn syn(id: u32, payload: &'static [u8]) -> Frame {
    Frame::new_data(StreamId::new(id), Bytes::from_static(payload), false, true)
}

test_with_timeout!(test_basic_data_transfer, 30, {
    let (client, server) = session_pair(Config::default()).await;

    // Nothing reaches the peer before the first write
    let mut client_stream = client.open_stream().await?;
    let test_data = b"Hello, virtmux integration test!";
    client_stream.write_all(test_data).await?;

    let mut server_stream = server.accept_stream().await?;
    assert_eq!(client_stream.id(), server_stream.id());

    let mut buffer = vec![0u8; test_data.len()];
    server_stream.read_exact(&mut buffer).await?;
    assert_eq!(buffer, test_data);

    server_stream.write_all(b"pong").await?;
    let mut reply = [0u8; 4];
    client_stream.read_exact(&mut reply).await?;
    assert_eq!(&reply, b"pong");

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_bidirectional_transfer, 30, {
    let (client, server) = session_pair(Config::default()).await;

    let mut client_stream = client.open_stream().await?;
    client_stream.write_all(b"open").await?;
    let mut server_stream = server.accept_stream().await?;
    let mut open = [0u8; 4];
    server_stream.read_exact(&mut open).await?;

    let client_task = tokio::spawn(async move {
        client_stream.write_all(b"Client -> Server").await.unwrap();
        let mut buf = [0u8; 16];
        client_stream.read_exact(&mut buf).await.unwrap();
        buf
    });
    let server_task = tokio::spawn(async move {
        server_stream.write_all(b"Server -> Client").await.unwrap();
        let mut buf = [0u8; 16];
        server_stream.read_exact(&mut buf).await.unwrap();
        buf
    });

    assert_eq!(&client_task.await?, b"Server -> Client");
    assert_eq!(&server_task.await?, b"Client -> Server");

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_close_write_is_half_close, 30, {
    let (client, server) = session_pair(Config::default()).await;

    let mut client_stream = client.open_stream().await?;
    client_stream.write_all(b"request").await?;
    client_stream.close_write().await?;

    let mut server_stream = server.accept_stream().await?;
    let mut request = Vec::new();
    server_stream.read_to_end(&mut request).await?;
    assert_eq!(request, b"request");

    // The other direction is still open
    server_stream.write_all(b"response").await?;
    server_stream.close_write().await?;

    let mut response = Vec::new();
    client_stream.read_to_end(&mut response).await?;
    assert_eq!(response, b"response");

    // Writing after FIN fails
    assert!(client_stream.write_all(b"late").await.is_err());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_open_before_accept_with_lazy_syn, 30, {
    let (client, server) = session_pair(Config::default()).await;

    let _unused = client.open_stream().await?;
    let mut used = client.open_stream().await?;
    used.write_all(b"x").await?;

    // Only the stream that wrote was announced
    let accepted = server.accept_stream().await?;
    assert_eq!(accepted.id(), used.id());
    assert_eq!(accepted.id().get(), 3);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_stream_reset_reaches_peer, 30, {
    let (client, server) = session_pair(Config::default()).await;

    let mut client_stream = client.open_stream().await?;
    client_stream.write_all(b"x").await?;
    let mut server_stream = server.accept_stream().await?;
    let mut first = [0u8; 1];
    server_stream.read_exact(&mut first).await?;

    client_stream.reset(ErrorCode::StreamCancelled).await?;

    let err = server_stream.read(&mut first).await.unwrap_err();
    let (code, _) = virtmux::get_error(&err);
    assert_eq!(code, ErrorCode::StreamCancelled);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_wait_reports_both_sides, 30, {
    let (client, server) = session_pair(Config::default()).await;

    client.close().await?;

    let server_end = server.wait().await;
    assert_eq!(server_end.local_error.code(), ErrorCode::PeerEof);
    assert_eq!(server_end.remote_error, Some(ErrorCode::NoError));

    let client_end = client.wait().await;
    assert_eq!(client_end.local_error.code(), ErrorCode::SessionClosed);

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_read_deadline, 30, {
    let (client, server) = session_pair(Config::default()).await;

    let mut client_stream = client.open_stream().await?;
    client_stream.write_all(b"x").await?;
    let mut server_stream = server.accept_stream().await?;
    let mut first = [0u8; 1];
    server_stream.read_exact(&mut first).await?;

    server_stream.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(50)));
    let err = server_stream.read(&mut first).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    // The session and other streams are unaffected
    assert!(!server.is_closed());
    client_stream.write_all(b"y").await?;
    server_stream.set_read_deadline(None);
    server_stream.read_exact(&mut first).await?;
    assert_eq!(&first, b"y");

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_wrong_parity_syn_is_fatal, 30, {
    let (server, mut peer) = server_with_raw_peer(Config::default()).await;

    // Even ids belong to the accepting side
    peer.send(syn(2, b"hi")).await?;

    let end = server.wait().await;
    assert_eq!(end.local_error.code(), ErrorCode::ProtocolError);

    let go_away = next_frame(&mut peer).await;
    assert!(matches!(
        go_away.frame_type,
        FrameType::GoAway {
            error_code: ErrorCode::ProtocolError,
            ..
        }
    ));

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_data_for_unknown_stream_is_reset, 30, {
    let (server, mut peer) = server_with_raw_peer(Config::default()).await;

    peer.send(Frame::new_data(StreamId::new(5), Bytes::from_static(b"??"), false, false))
        .await?;

    let rst = next_frame(&mut peer).await;
    assert_eq!(rst.stream_id, StreamId::new(5));
    assert_eq!(
        rst.frame_type,
        FrameType::Rst {
            error_code: ErrorCode::StreamClosed
        }
    );
    assert!(!server.is_closed());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_data_after_fin_is_reset, 30, {
    let (server, mut peer) = server_with_raw_peer(Config::default()).await;

    peer.send(Frame::new_data(StreamId::new(1), Bytes::from_static(b"done"), true, true))
        .await?;
    peer.send(Frame::new_data(StreamId::new(1), Bytes::from_static(b"more"), false, false))
        .await?;

    let rst = next_frame(&mut peer).await;
    assert_eq!(rst.stream_id, StreamId::new(1));
    assert_eq!(
        rst.frame_type,
        FrameType::Rst {
            error_code: ErrorCode::StreamClosed
        }
    );
    assert!(!server.is_closed());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_accept_backlog_overflow_refuses_stream, 30, {
    let config = ConfigBuilder::new().accept_backlog(1).build()?;
    let (server, mut peer) = server_with_raw_peer(config).await;

    peer.send(syn(1, b"first")).await?;
    peer.send(syn(3, b"second")).await?;

    let rst = next_frame(&mut peer).await;
    assert_eq!(rst.stream_id, StreamId::new(3));
    assert_eq!(
        rst.frame_type,
        FrameType::Rst {
            error_code: ErrorCode::StreamRefused
        }
    );

    let mut accepted = server.accept_stream().await?;
    assert_eq!(accepted.id(), StreamId::new(1));
    let mut buf = [0u8; 5];
    accepted.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"first");

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_remote_go_away, 30, {
    let (client, mut peer) = client_with_raw_peer(Config::default()).await;

    let mut stream = client.open_stream().await?;
    stream.write_all(b"x").await?;
    let data = next_frame(&mut peer).await;
    assert!(data.is_syn());

    // The peer never processed stream 1
    peer.send(Frame::new_go_away(
        StreamId::ZERO,
        ErrorCode::NoError,
        Bytes::from_static(b"maintenance"),
    ))
    .await?;

    let mut buf = [0u8; 1];
    assert!(stream.read(&mut buf).await.is_err());
    assert!(matches!(
        client.open_stream().await,
        Err(MuxError::RemoteGoneAway)
    ));
    assert!(!client.is_closed());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_local_go_away_refuses_new_streams, 30, {
    let (server, mut peer) = server_with_raw_peer(Config::default()).await;

    peer.send(syn(1, b"a")).await?;
    let _accepted = server.accept_stream().await?;

    server.go_away(ErrorCode::NoError, "draining").await?;
    let go_away = next_frame(&mut peer).await;
    assert_eq!(
        go_away.frame_type,
        FrameType::GoAway {
            last_stream_id: StreamId::new(1),
            error_code: ErrorCode::NoError,
        }
    );
    assert_eq!(&go_away.data[..], b"draining");

    peer.send(syn(3, b"b")).await?;
    let rst = next_frame(&mut peer).await;
    assert_eq!(rst.stream_id, StreamId::new(3));
    assert_eq!(
        rst.frame_type,
        FrameType::Rst {
            error_code: ErrorCode::StreamRefused
        }
    );

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_unknown_frame_type_is_skipped, 30, {
    let (server, mut peer) = server_with_raw_peer(Config::default()).await;

    // Header with type 0xA and a 3 byte body, then a regular SYN
    let raw = [0x00, 0x00, 0x03, 0xA0, 0x00, 0x00, 0x00, 0x01, 1, 2, 3];
    peer.get_mut().write_all(&raw).await?;
    peer.send(syn(1, b"ok")).await?;

    let mut accepted = server.accept_stream().await?;
    let mut buf = [0u8; 2];
    accepted.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ok");

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_zero_window_increment_resets_only_its_stream, 30, {
    let (server, mut peer) = server_with_raw_peer(Config::default()).await;

    peer.send(syn(1, b"a")).await?;
    peer.send(syn(3, b"b")).await?;
    let mut first = server.accept_stream().await?;
    let mut second = server.accept_stream().await?;

    // WNDINC on stream 1 carrying zero credit
    let raw = [0x00, 0x00, 0x04, 0x20, 0x00, 0x00, 0x00, 0x01, 0, 0, 0, 0];
    peer.get_mut().write_all(&raw).await?;

    let rst = next_frame(&mut peer).await;
    assert_eq!(rst.stream_id, StreamId::new(1));
    assert_eq!(
        rst.frame_type,
        FrameType::Rst {
            error_code: ErrorCode::ProtocolError
        }
    );
    assert!(first.write_all(b"late").await.is_err());

    // The session and the other stream keep working
    assert!(!server.is_closed());
    let mut buf = [0u8; 1];
    second.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"b");
    second.write_all(b"still here").await?;
    let reply = loop {
        let frame = next_frame(&mut peer).await;
        if frame.frame_type == FrameType::Data {
            break frame;
        }
    };
    assert_eq!(reply.stream_id, StreamId::new(3));
    assert_eq!(reply.data, Bytes::from_static(b"still here"));

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_close_write_after_session_death_returns, 30, {
    let config = ConfigBuilder::new()
        .go_away_timeout(Duration::from_millis(500))
        .build()?;
    // Nobody drains the other end, so the writer stalls
    let (a, _b) = tokio::io::duplex(8);
    let session = Session::client(a, config).await?;

    let mut streams = Vec::new();
    for _ in 0..20 {
        streams.push(session.open_stream().await?);
    }
    let closing = tokio::spawn({
        let session = session.clone();
        async move { session.close().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    for stream in &mut streams {
        let finished = tokio::time::timeout(Duration::from_secs(3), stream.close_write()).await;
        assert!(finished.is_ok(), "close_write hung on stream {}", stream.id());
    }
    closing.await??;

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_stream_factory_sees_every_stream, 30, {
    let built = Arc::new(Mutex::new(Vec::new()));
    let config = ConfigBuilder::new()
        .stream_factory({
            let built = Arc::clone(&built);
            move |stream: virtmux::Stream| {
                built.lock().unwrap().push(stream.id().get());
                stream
            }
        })
        .build()?;
    let (client, server) = session_pair(config).await;

    let mut opened = client.open_stream().await?;
    opened.write_all(b"hi").await?;
    let mut accepted = server.accept_stream().await?;
    let mut buf = [0u8; 2];
    accepted.read_exact(&mut buf).await?;

    let mut reverse = server.open_stream().await?;
    reverse.write_all(b"yo").await?;
    let _ = client.accept_stream().await?;

    // Opened by the client, accepted by the server, then the reverse
    assert_eq!(*built.lock().unwrap(), vec![1, 1, 2, 2]);

    Ok::<(), Box<dyn std::error::Error>>(())
});
