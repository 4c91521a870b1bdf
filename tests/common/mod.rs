/// Common utilities for integration tests
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("Failed to bind echo server");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Start a stub upstream proxy that answers every CONNECT with the given
/// status line and then signals whether the connection saw EOF afterwards
pub async fn start_refusing_proxy(
    port: u16,
    status_line: &'static str,
) -> tokio::sync::oneshot::Receiver<bool> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("Failed to bind stub proxy");
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("stub proxy accept");
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(format!("{}\r\n\r\n", status_line).as_bytes())
            .await
            .expect("stub proxy write");
        // Report EOF observation so tests can assert the leg was closed
        let n = socket.read(&mut buf).await.unwrap_or(0);
        let _ = tx.send(n == 0);
    });
    rx
}

/// Send a CONNECT request to the proxy and return (stream, response head)
pub async fn connect_through_proxy(
    proxy_port: u16,
    target: &str,
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .expect("Failed to connect to proxy");
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to send CONNECT");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("Failed to read response");
        if n == 0 {
            break;
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8(head).expect("Response head is not UTF-8");
    (stream, head)
}

/// Wait until a TCP port accepts connections
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if timeout(
            Duration::from_millis(200),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
