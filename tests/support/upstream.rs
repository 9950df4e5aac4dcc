use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::read_until_double_crlf;

struct CannedResponse {
    head: Vec<u8>,
    body: Vec<u8>,
}

/// Raw TCP origin answering every request with one canned HTTP/1.1 response.
pub struct TestUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn respond_with(headers: &[(&str, &str)], body: impl Into<Vec<u8>>) -> Result<Self> {
        let body = body.into();
        let mut head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n",
            body.len()
        );
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        Self::spawn(Arc::new(CannedResponse {
            head: head.into_bytes(),
            body,
        }))
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Request heads received so far, in arrival order.
    pub fn heads(&self) -> Vec<String> {
        self.heads.lock().clone()
    }

    async fn spawn(response: Arc<CannedResponse>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let requests = requests.clone();
            let heads = heads.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let response = response.clone();
                    let requests = requests.clone();
                    let heads = heads.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, &response, &requests, &heads).await;
                    });
                }
            })
        };
        Ok(Self {
            addr,
            requests,
            heads,
            handle,
        })
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    response: &CannedResponse,
    requests: &AtomicUsize,
    heads: &Mutex<Vec<String>>,
) -> Result<()> {
    let head = read_until_double_crlf(&mut stream).await?;
    if head.is_empty() {
        return Ok(());
    }
    requests.fetch_add(1, Ordering::SeqCst);
    let is_head = head.starts_with("HEAD ");
    heads.lock().push(head);
    stream.write_all(&response.head).await?;
    if !is_head {
        stream.write_all(&response.body).await?;
    }
    stream.shutdown().await.ok();
    Ok(())
}
