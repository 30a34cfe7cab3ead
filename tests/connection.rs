use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};

use resplog::connection::Connection;
use resplog::frame::Frame;

/// Returns a connected client stream, plus a channel whose messages the server side writes to
/// the socket. Dropping the sender closes the server side.
async fn create_tcp_connection() -> Result<(UnboundedSender<Vec<u8>>, TcpStream), std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            while let Some(data) = rx.recv().await {
                if socket.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    let stream = TcpStream::connect(local_addr).await?;

    Ok((tx, stream))
}

async fn read_one(bytes: &[u8]) -> Option<Frame> {
    let (tcp_stream_tx, tcp_stream) = create_tcp_connection().await.unwrap();
    let mut connection = Connection::new(tcp_stream);

    tcp_stream_tx.send(bytes.to_vec()).unwrap();

    connection.read_frame().await.unwrap()
}

#[tokio::test]
async fn test_read_simple_string() {
    let actual = read_one(b"+OK\r\n").await;

    assert_eq!(actual, Some(Frame::Simple("OK".to_string())));
}

#[tokio::test]
async fn test_read_bulk_string_with_crlf_payload() {
    let actual = read_one(b"$7\r\nhel\r\nlo\r\n").await;

    assert_eq!(actual, Some(Frame::Bulk(Bytes::from("hel\r\nlo"))));
}

#[tokio::test]
async fn test_read_null_bulk_string() {
    let actual = read_one(b"$-1\r\n").await;

    assert_eq!(actual, Some(Frame::Null));
}

#[tokio::test]
async fn test_read_command() {
    let actual = read_one(b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n").await;

    assert_eq!(actual, Some(Frame::command(["SET", "mykey", "myvalue"])));
}

#[tokio::test]
async fn test_read_multiple_frames_sequentially() {
    let (tcp_stream_tx, tcp_stream) = create_tcp_connection().await.unwrap();
    let mut connection = Connection::new(tcp_stream);

    // Everything in one write, the connection has to split it up.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$7\r\nmykey_1\r\n$9\r\nmyvalue_1\r\n");
    bytes.extend_from_slice(b"-Error message\r\n");
    bytes.extend_from_slice(b":1000\r\n");
    bytes.extend_from_slice(b"*2\r\n$3\r\nDEL\r\n$7\r\nmykey_1\r\n");
    tcp_stream_tx.send(bytes).unwrap();

    let actual = connection.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::command(["SET", "mykey_1", "myvalue_1"])));

    let actual = connection.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Error(String::from("Error message"))));

    let actual = connection.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Integer(1000)));

    let actual = connection.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::command(["DEL", "mykey_1"])));
}

#[tokio::test]
async fn test_read_frame_split_across_writes() {
    let (tcp_stream_tx, tcp_stream) = create_tcp_connection().await.unwrap();
    let mut connection = Connection::new(tcp_stream);

    // "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n" in three parts, the second one
    // cutting through a length line.
    let part1 = b"*3\r\n$3\r\nSE";
    let part2 = b"T\r\n$";
    let part3 = b"5\r\nmykey\r\n$7\r\nmyvalue\r\n";

    tokio::spawn(async move {
        let parts = vec![part1.to_vec(), part2.to_vec(), part3.to_vec()];
        for part in parts {
            tcp_stream_tx.send(part).unwrap();
            // Simulate a delay in sending/receiving the data.
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
    });

    let actual = connection.read_frame().await.unwrap();

    assert_eq!(actual, Some(Frame::command(["SET", "mykey", "myvalue"])));
}

#[tokio::test]
async fn test_peer_close_between_frames() {
    let (tcp_stream_tx, tcp_stream) = create_tcp_connection().await.unwrap();
    let mut connection = Connection::new(tcp_stream);

    tcp_stream_tx.send(b"+PONG\r\n".to_vec()).unwrap();
    drop(tcp_stream_tx);

    let actual = connection.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Simple("PONG".to_string())));

    let actual = connection.read_frame().await.unwrap();
    assert_eq!(actual, None);
}

#[tokio::test]
async fn test_peer_close_mid_frame() {
    let (tcp_stream_tx, tcp_stream) = create_tcp_connection().await.unwrap();
    let mut connection = Connection::new(tcp_stream);

    tcp_stream_tx.send(b"*2\r\n$3\r\nGET\r\n".to_vec()).unwrap();
    drop(tcp_stream_tx);

    assert!(connection.read_frame().await.is_err());
}

#[tokio::test]
async fn test_read_malformed_frame() {
    let (tcp_stream_tx, tcp_stream) = create_tcp_connection().await.unwrap();
    let mut connection = Connection::new(tcp_stream);

    tcp_stream_tx.send(b"*two\r\n".to_vec()).unwrap();

    assert!(connection.read_frame().await.is_err());
}

#[tokio::test]
async fn test_write_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(local_addr).await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    });

    let (socket, _) = listener.accept().await.unwrap();
    let mut connection = Connection::new(socket);
    connection
        .write_frame(&Frame::Array(vec![
            Frame::Simple("OK".to_string()),
            Frame::Null,
        ]))
        .await
        .unwrap();
    drop(connection);

    assert_eq!(client.await.unwrap(), b"*2\r\n+OK\r\n$-1\r\n");
}
