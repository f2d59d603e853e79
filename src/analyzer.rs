//! Analyzer API endpoint
//!
//! Only the API root is served: it is what the all-in-one supervisor polls
//! to decide the analyzer is up. Requests are handled by `tiny_http` on a
//! dedicated thread.

use crate::supervisor::address::ServiceAddress;
use crate::VERSION;
use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::future::Future;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response};
use topowatch_common::API_ROOT;
use tracing::{debug, error, info, warn};

/// How often the request loop checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Handle to the running API server
pub struct AnalyzerServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl AnalyzerServer {
    pub fn start(listen: &ServiceAddress) -> Result<Self> {
        let server = tiny_http::Server::http((listen.host.as_str(), listen.port))
            .map_err(|e| anyhow!("can't listen on {}: {}", listen, e))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("{} is not an IP listener", listen))?;
        info!("Analyzer API listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("topowatch-api".to_string())
            .spawn({
                let shutdown = shutdown.clone();
                move || serve_loop(server, &shutdown)
            })
            .context("failed to spawn analyzer API thread")?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for the request loop to exit
    pub fn shutdown(mut self) {
        self.stop();
        info!("Analyzer API stopped");
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Analyzer API thread panicked");
            }
        }
    }
}

impl Drop for AnalyzerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve on `listen` until `shutdown` resolves
pub async fn serve<F>(listen: &ServiceAddress, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let server = AnalyzerServer::start(listen)?;
    shutdown.await;
    tokio::task::spawn_blocking(move || server.shutdown()).await?;
    Ok(())
}

fn serve_loop(server: tiny_http::Server, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        let request = match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!("Analyzer API accept error: {}", e);
                }
                break;
            }
        };
        respond(request);
    }
}

fn respond(request: Request) {
    let (status, body) = route(request.method(), request.url());
    debug!("{} {} -> {}", request.method(), request.url(), status);
    if let Err(e) = request.respond(json_response(status, body)) {
        debug!("Failed to send analyzer API response: {}", e);
    }
}

fn route(method: &Method, url: &str) -> (u16, serde_json::Value) {
    let path = url.split('?').next().unwrap_or_default();
    match (method, path.trim_end_matches('/') == API_ROOT) {
        (Method::Get, true) => (200, json!({ "service": "analyzer", "version": VERSION })),
        (_, true) => (405, json!({ "error": "method not allowed" })),
        (_, false) => (404, json!({ "error": "not found" })),
    }
}

fn json_response(status: u16, body: serde_json::Value) -> Response<Cursor<Vec<u8>>> {
    let response = Response::from_string(body.to_string()).with_status_code(status);
    match Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::readiness::{HttpRestClient, ReadinessCheck, RestClient, RetryPolicy};
    use std::io::Write;
    use std::net::TcpStream;

    fn local() -> ServiceAddress {
        ServiceAddress::parse("127.0.0.1:0").unwrap()
    }

    fn client(server: &AnalyzerServer) -> HttpRestClient {
        HttpRestClient::new(
            format!("http://{}", server.addr()),
            None,
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_route() {
        assert_eq!(route(&Method::Get, "/api").0, 200);
        assert_eq!(route(&Method::Get, "/api/").0, 200);
        assert_eq!(route(&Method::Get, "/api?verbose=1").0, 200);
        assert_eq!(route(&Method::Post, "/api").0, 405);
        assert_eq!(route(&Method::Get, "/topology").0, 404);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readiness_against_live_endpoint() {
        let server = AnalyzerServer::start(&local()).unwrap();
        let client = client(&server);

        let check = ReadinessCheck::new(API_ROOT, RetryPolicy::fixed(5, Duration::from_millis(20)));
        assert_eq!(check.wait(&client).await.unwrap(), 1);

        let response = client.request("GET", API_ROOT, &[], None).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["service"], "analyzer");
        assert_eq!(body["version"], VERSION);

        let missing = client.request("GET", "/nope", &[], None).await.unwrap();
        assert_eq!(missing.status, 404);

        tokio::task::spawn_blocking(move || server.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_client_does_not_block_api() {
        let server = AnalyzerServer::start(&local()).unwrap();

        // Unterminated request line, connection held open
        let mut stalled = TcpStream::connect(server.addr()).unwrap();
        stalled.write_all(&vec![b'A'; 64 * 1024]).unwrap();

        let response = client(&server)
            .request("GET", API_ROOT, &[], None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let stopped = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || server.shutdown()),
        )
        .await;
        assert!(stopped.is_ok(), "shutdown blocked by stalled client");
        drop(stalled);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown_future() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            serve(&local(), async {
                let _ = rx.await;
            })
            .await
        });
        tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
