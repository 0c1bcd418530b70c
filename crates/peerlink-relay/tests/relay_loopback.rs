//! End-to-end relay client test over a loopback TCP listener.
//!
//! The listener plays the relay: it reads whatever the client sends with the
//! same `MessageReader` and echoes a reply back.

use std::time::Duration;

use peerlink_relay::{FramedMessage, MessageReader, RelayClient, WireFormat, write_message};
use tokio::net::TcpListener;

async fn relay_roundtrip(format: WireFormat) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes: q3.txt");
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &content).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half, format);

        let first = reader.read_message().await.unwrap().unwrap();
        let second = reader.read_message().await.unwrap().unwrap();

        let reply = FramedMessage::device_delete(vec!["stale-device".into()], "relay");
        write_message(&mut write_half, format, &reply).await.unwrap();
        (first, second)
    });

    let mut client = RelayClient::connect("127.0.0.1", port, format, Duration::from_secs(5))
        .await
        .unwrap();
    let sent = client.serve_file(&path).await.unwrap();
    assert_eq!(sent, content.len() as u64);
    client
        .request_device_delete(&["laptop".into(), "phone".into()], "ana")
        .await
        .unwrap();

    let reply = client.next_message().await.unwrap().unwrap();
    assert_eq!(
        reply,
        FramedMessage::DeviceDeleteRequest {
            device_names: vec!["stale-device".into()],
            reserved: String::new(),
            username: "relay".into(),
        }
    );

    let (first, second) = relay.await.unwrap();
    match first {
        FramedMessage::FileRequestResponse { filename, file_size, payload, .. } => {
            assert_eq!(filename, "notes: q3.txt");
            assert_eq!(file_size, content.len() as u64);
            assert_eq!(&payload[..], &content[..]);
        }
        other => panic!("expected file response, got {:?}", other),
    }
    assert_eq!(
        second,
        FramedMessage::device_delete(vec!["laptop".into(), "phone".into()], "ana")
    );

    // Relay task has dropped its socket.
    assert!(client.next_message().await.unwrap().is_none());
}

#[tokio::test]
async fn legacy_framing_over_tcp() {
    relay_roundtrip(WireFormat::Legacy).await;
}

#[tokio::test]
async fn length_prefixed_framing_over_tcp() {
    relay_roundtrip(WireFormat::LengthPrefixed).await;
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let res =
        RelayClient::connect("127.0.0.1", port, WireFormat::Legacy, Duration::from_secs(2)).await;
    assert!(res.is_err());
}
