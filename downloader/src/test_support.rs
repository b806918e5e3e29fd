/// Test fixtures: a paced byte-trickle server for stall scenarios and a
/// `.tar.gz` builder. Plain request/response routes go through httpmock.
use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Response body written chunk by chunk with a pause after each one, then the
/// connection is held open for `hold_open` before closing.
#[derive(Debug, Clone)]
pub struct Trickle {
    pub content_length: Option<u64>,
    pub chunks: Vec<Vec<u8>>,
    pub interval: Duration,
    pub hold_open: Duration,
}

/// Answer every request on an ephemeral port with `trickle`.
pub async fn spawn_trickle(trickle: Trickle) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let trickle = trickle.clone();
            tokio::spawn(async move {
                serve(socket, trickle).await;
            });
        }
    });

    addr
}

async fn serve(mut socket: TcpStream, trickle: Trickle) {
    if !read_request_head(&mut socket).await {
        return;
    }

    let mut head = String::from("HTTP/1.1 200 OK\r\nConnection: close\r\n");
    if let Some(len) = trickle.content_length {
        head.push_str(&format!("Content-Length: {}\r\n", len));
    }
    head.push_str("\r\n");
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    for chunk in trickle.chunks {
        if socket.write_all(&chunk).await.is_err() || socket.flush().await.is_err() {
            return;
        }
        tokio::time::sleep(trickle.interval).await;
    }
    tokio::time::sleep(trickle.hold_open).await;
    let _ = socket.shutdown().await;
}

async fn read_request_head(socket: &mut TcpStream) -> bool {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    true
}

/// Write a `.tar.gz` containing `files` (path, contents), all mode 0755.
pub fn build_tar_gz(dest: &Path, files: &[(&str, &[u8])]) {
    let file = File::create(dest).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
