//! Integration tests driving the TCP interface over real localhost sockets

use modlink::{
    ConnectionListener, DeviceCollector, ListenerConfig, ModbusInterface, TcpConfig, TcpInterface,
    TelegramContext, TelegramKind, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// One connected master/device interface pair over a loopback socket
async fn interface_pair() -> (TcpInterface, TcpInterface) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let connect = tokio::spawn(async move {
        TcpInterface::connect(TcpConfig::new("127.0.0.1", port))
            .await
            .unwrap()
    });

    let (stream, _) = listener.accept().await.unwrap();
    let device = TcpInterface::from_stream(stream, 252);
    (connect.await.unwrap(), device)
}

/// A master interface whose peer is a raw socket under test control
async fn master_with_raw_peer() -> (TcpInterface, tokio::net::TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let connect = tokio::spawn(async move {
        TcpInterface::connect(TcpConfig::new("127.0.0.1", port))
            .await
            .unwrap()
    });

    let (stream, _) = listener.accept().await.unwrap();
    (connect.await.unwrap(), stream)
}

#[tokio::test]
async fn request_response_round_trip() {
    let (mut master, mut device) = interface_pair().await;

    let mut frame = vec![0u8; master.max_telegram_length()];
    let request = master
        .create_telegram(0x01, 0x03, 4, &mut frame, TelegramKind::Request, TelegramContext::None)
        .unwrap();
    frame[request.data_offset..request.data_offset + 4].copy_from_slice(&[0x00, 0x6B, 0x00, 0x02]);
    master.send_telegram(&mut frame, request.length).await.unwrap();

    // Device side: assemble, parse, answer with the echoed context.
    let mut device_frame = vec![0u8; device.max_telegram_length()];
    let len = device
        .receive_telegram(&mut device_frame, None, RESPONSE_TIMEOUT)
        .await
        .unwrap()
        .expect("request did not arrive");
    assert_eq!(len, request.length);

    let parsed = device
        .parse_telegram(&device_frame, len, TelegramKind::Request, TelegramContext::None)
        .unwrap()
        .unwrap();
    assert_eq!(parsed.address, 0x01);
    assert_eq!(parsed.function, 0x03);
    assert_eq!(parsed.data_length, 4);
    assert_eq!(parsed.context, request.context);

    let response = device
        .create_telegram(0x01, 0x03, 5, &mut device_frame, TelegramKind::Response, parsed.context)
        .unwrap();
    device_frame[response.data_offset..response.data_offset + 5]
        .copy_from_slice(&[0x04, 0x00, 0x0A, 0x00, 0x0B]);
    device
        .send_telegram(&mut device_frame, response.length)
        .await
        .unwrap();

    // Master side: the reply correlates with the original request.
    let len = master
        .receive_telegram(&mut frame, Some(5), RESPONSE_TIMEOUT)
        .await
        .unwrap()
        .expect("response did not arrive");
    let reply = master
        .parse_telegram(&frame, len, TelegramKind::Response, request.context)
        .unwrap()
        .expect("transaction id did not match");
    assert_eq!(reply.data_length, 5);
    assert_eq!(&frame[reply.data_offset..reply.data_offset + 5], &[0x04, 0x00, 0x0A, 0x00, 0x0B]);

    assert_eq!(master.stats().telegrams_sent, 1);
    assert_eq!(master.stats().telegrams_received, 1);
}

#[tokio::test]
async fn receive_timeout_returns_none() {
    let (mut master, _device) = interface_pair().await;

    let mut frame = vec![0u8; master.max_telegram_length()];
    let outcome = master
        .receive_telegram(&mut frame, None, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(master.stats().receive_timeouts, 1);
}

#[tokio::test]
async fn foreign_transaction_id_keeps_the_caller_listening() {
    let (mut master, mut device) = interface_pair().await;

    let mut frame = vec![0u8; master.max_telegram_length()];
    let request = master
        .create_telegram(0x01, 0x04, 0, &mut frame, TelegramKind::Request, TelegramContext::None)
        .unwrap();
    master.send_telegram(&mut frame, request.length).await.unwrap();

    let mut device_frame = vec![0u8; device.max_telegram_length()];
    device
        .receive_telegram(&mut device_frame, None, RESPONSE_TIMEOUT)
        .await
        .unwrap()
        .unwrap();

    // A reply for some other outstanding exchange arrives first.
    let stale = device
        .create_telegram(0x01, 0x04, 0, &mut device_frame, TelegramKind::Response, TelegramContext::Transaction(0x0063))
        .unwrap();
    device.send_telegram(&mut device_frame, stale.length).await.unwrap();

    let len = master
        .receive_telegram(&mut frame, Some(0), RESPONSE_TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert!(master
        .parse_telegram(&frame, len, TelegramKind::Response, request.context)
        .unwrap()
        .is_none());

    // The right reply is still acceptable afterwards.
    let good = device
        .create_telegram(0x01, 0x04, 0, &mut device_frame, TelegramKind::Response, request.context)
        .unwrap();
    device.send_telegram(&mut device_frame, good.length).await.unwrap();

    let len = master
        .receive_telegram(&mut frame, Some(0), RESPONSE_TIMEOUT)
        .await
        .unwrap()
        .unwrap();
    assert!(master
        .parse_telegram(&frame, len, TelegramKind::Response, request.context)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn frame_dribbled_byte_by_byte_is_reassembled() {
    let (mut master, mut peer) = master_with_raw_peer().await;

    let frame = [0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x01, 0x04, 0xAA, 0xBB];
    let writer = tokio::spawn(async move {
        for byte in frame {
            peer.write_all(&[byte]).await.unwrap();
            peer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        peer
    });

    let mut buffer = vec![0u8; master.max_telegram_length()];
    let len = master
        .receive_telegram(&mut buffer, None, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("frame was not reassembled");
    assert_eq!(len, 10);
    assert_eq!(&buffer[..10], &frame);

    writer.await.unwrap();
}

#[tokio::test]
async fn oversized_frame_is_a_buffer_error() {
    let (mut master, mut peer) = master_with_raw_peer().await;

    // Header announces 300 remaining bytes; the caller's buffer holds 260.
    let header = [0x00, 0x00, 0x00, 0x00, 0x01, 0x2C];
    peer.write_all(&header).await.unwrap();

    let mut buffer = vec![0u8; 260];
    let outcome = master
        .receive_telegram(&mut buffer, None, RESPONSE_TIMEOUT)
        .await;
    assert!(matches!(outcome, Err(TransportError::BufferTooSmall { .. })));
}

#[tokio::test]
async fn probes_track_pending_bytes_and_liveness() {
    let (mut master, mut device) = interface_pair().await;

    assert!(master.is_connection_ok().await);
    assert!(!master.is_data_available().await);

    let mut frame = vec![0u8; device.max_telegram_length()];
    let stale = device
        .create_telegram(0x05, 0x03, 0, &mut frame, TelegramKind::Request, TelegramContext::None)
        .unwrap();
    device.send_telegram(&mut frame, stale.length).await.unwrap();

    // The probe flips once the bytes land in the receive queue.
    let mut available = false;
    for _ in 0..50 {
        if master.is_data_available().await {
            available = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(available);

    // Clearing the stale request empties the queue again.
    master.clear_input_buffer().await.unwrap();
    assert!(!master.is_data_available().await);

    // An orderly close on the far side turns the liveness probe off.
    device.close().await;
    let mut ok = true;
    for _ in 0..50 {
        ok = master.is_connection_ok().await;
        if !ok {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!ok);
}

#[tokio::test]
async fn closed_interface_is_unusable() {
    let (mut master, _device) = interface_pair().await;
    master.close().await;

    let mut frame = vec![0u8; 16];
    assert!(matches!(
        master.send_telegram(&mut frame, 8).await,
        Err(TransportError::Closed)
    ));
    assert!(!master.is_connection_ok().await);
}

#[tokio::test]
async fn listener_spawns_one_interface_per_connection() {
    let (tx, mut rx) = mpsc::channel::<TcpInterface>(4);
    let collector: Arc<dyn DeviceCollector> = Arc::new(tx);

    let listener = ConnectionListener::bind(
        ListenerConfig::new(0).host("127.0.0.1"),
        collector,
    )
    .await
    .unwrap();
    let port = listener.local_addr().port();

    let mut master = TcpInterface::connect(TcpConfig::new("127.0.0.1", port))
        .await
        .unwrap();
    let mut device = rx.recv().await.expect("listener did not register the connection");

    // The spawned interface is live: pass one request through it.
    let mut frame = vec![0u8; master.max_telegram_length()];
    let request = master
        .create_telegram(0x02, 0x06, 4, &mut frame, TelegramKind::Request, TelegramContext::None)
        .unwrap();
    frame[request.data_offset..request.data_offset + 4].copy_from_slice(&[0x00, 0x01, 0x00, 0x03]);
    master.send_telegram(&mut frame, request.length).await.unwrap();

    let mut device_frame = vec![0u8; device.max_telegram_length()];
    let len = device
        .receive_telegram(&mut device_frame, Some(4), RESPONSE_TIMEOUT)
        .await
        .unwrap()
        .expect("request did not reach the spawned interface");
    let parsed = device
        .parse_telegram(&device_frame, len, TelegramKind::Request, TelegramContext::None)
        .unwrap()
        .unwrap();
    assert_eq!(parsed.address, 0x02);
    assert_eq!(parsed.function, 0x06);

    // A second connection gets its own interface.
    let _second = TcpInterface::connect(TcpConfig::new("127.0.0.1", port))
        .await
        .unwrap();
    assert!(rx.recv().await.is_some());

    // Shutdown is bounded and leaves already-spawned interfaces alone.
    tokio::time::timeout(Duration::from_secs(6), listener.shutdown())
        .await
        .expect("shutdown exceeded its join bound");
    assert!(device.is_connection_ok().await);
}
