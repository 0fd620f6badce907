use crate::error::TransportError;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use url::Url;

/// Outcome of one request as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub completed_at: Instant,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pending completion of a request. Owns everything it needs, so several can
/// be outstanding on one connection at once.
pub type Completion = Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send>>;

pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn Connection>, TransportError>> + Send + 'a>>;

/// Factory for connections to the target server.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn open<'a>(&'a self, url: &'a Url) -> OpenFuture<'a>;
}

/// One logical connection. Completions resolve in any order; the driver
/// consumes them in issue order.
pub trait Connection: Send {
    fn send_get(&mut self, url: &Url) -> Completion;

    fn close(&mut self);
}

/// HTTP transport backed by one reqwest client per connection.
pub struct HttpTransport {
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn client(&self) -> Result<reqwest::Client, TransportError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30));
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn open<'a>(&'a self, url: &'a Url) -> OpenFuture<'a> {
        Box::pin(async move {
            let client = self.client()?;
            // Probe once so an unreachable target fails here rather than
            // mid-phase, and the socket is already pooled for the first send.
            let response = client.get(url.clone()).send().await.map_err(classify)?;
            response.bytes().await.map_err(classify)?;
            Ok(Box::new(HttpConnection {
                client: Some(client),
            }) as Box<dyn Connection>)
        })
    }
}

pub struct HttpConnection {
    client: Option<reqwest::Client>,
}

impl Connection for HttpConnection {
    fn send_get(&mut self, url: &Url) -> Completion {
        let Some(client) = self.client.as_ref() else {
            return Box::pin(async {
                Err(TransportError::Disconnected("connection closed".to_string()))
            });
        };
        let request = client.get(url.clone());
        Box::pin(async move {
            let response = request.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            // Drain the body so the socket goes back to the pool.
            response.bytes().await.map_err(classify)?;
            Ok(Response {
                status,
                completed_at: Instant::now(),
            })
        })
    }

    fn close(&mut self) {
        self.client = None;
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Disconnected(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

/// In-process server model for tests and dry runs.
///
/// Each connection serves one request at a time, so a request sent while an
/// earlier one is still being served queues behind it.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    service_time: Duration,
    /// Request number (1-based, per connection) that stalls, and for how long
    stall: Option<(u64, Duration)>,
    /// Every n-th request answers 500
    fail_every: Option<u64>,
    /// Every n-th request times out after its service time
    timeout_every: Option<u64>,
    /// Requests after the n-th fail with a lost connection
    disconnect_after: Option<u64>,
    /// Number of successful opens before open starts failing
    open_limit: Option<usize>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(service_time: Duration) -> Self {
        Self {
            service_time,
            ..Self::default()
        }
    }

    pub fn with_stall(mut self, request: u64, duration: Duration) -> Self {
        self.stall = Some((request, duration));
        self
    }

    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn with_timeout_every(mut self, n: u64) -> Self {
        self.timeout_every = Some(n.max(1));
        self
    }

    pub fn with_disconnect_after(mut self, n: u64) -> Self {
        self.disconnect_after = Some(n);
        self
    }

    pub fn with_open_limit(mut self, n: usize) -> Self {
        self.open_limit = Some(n);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open<'a>(&'a self, _url: &'a Url) -> OpenFuture<'a> {
        Box::pin(async move {
            if let Some(limit) = self.open_limit {
                if self.opened() >= limit {
                    return Err(TransportError::Disconnected(
                        "connection refused".to_string(),
                    ));
                }
            }
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(MockConnection {
                server: self.clone(),
                requests: 0,
                busy_until: None,
                open: true,
            }) as Box<dyn Connection>)
        })
    }
}

struct MockConnection {
    server: MockTransport,
    requests: u64,
    busy_until: Option<Instant>,
    open: bool,
}

impl Connection for MockConnection {
    fn send_get(&mut self, _url: &Url) -> Completion {
        self.requests += 1;
        let n = self.requests;

        let lost = !self.open || self.server.disconnect_after.is_some_and(|limit| n > limit);
        if lost {
            return Box::pin(async {
                Err(TransportError::Disconnected("server closed the connection".to_string()))
            });
        }

        let mut service = self.server.service_time;
        if let Some((at, stall)) = self.server.stall {
            if at == n {
                service += stall;
            }
        }
        let status = match self.server.fail_every {
            Some(every) if n % every == 0 => 500,
            _ => 200,
        };

        let timed_out = self.server.timeout_every.is_some_and(|every| n % every == 0);

        let now = Instant::now();
        let begins = self.busy_until.map_or(now, |busy| busy.max(now));
        let done = begins + service;
        self.busy_until = Some(done);

        Box::pin(async move {
            if done > Instant::now() {
                sleep_until(done).await;
            }
            if timed_out {
                return Err(TransportError::Timeout);
            }
            Ok(Response {
                status,
                completed_at: done,
            })
        })
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.server.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://localhost:8080/").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_serves_in_order() {
        let transport = MockTransport::new(Duration::from_millis(10));
        let mut conn = transport.open(&url()).await.unwrap();

        let start = Instant::now();
        let first = conn.send_get(&url());
        let second = conn.send_get(&url());

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a.completed_at, start + Duration::from_millis(10));
        // Queued behind the first request.
        assert_eq!(b.completed_at, start + Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_stall_and_failures() {
        let transport = MockTransport::new(Duration::from_millis(1))
            .with_stall(2, Duration::from_secs(2))
            .with_fail_every(3);
        let mut conn = transport.open(&url()).await.unwrap();

        let start = Instant::now();
        assert!(conn.send_get(&url()).await.unwrap().is_success());
        let stalled = conn.send_get(&url()).await.unwrap();
        assert!(stalled.completed_at - start >= Duration::from_secs(2));
        assert_eq!(conn.send_get(&url()).await.unwrap().status, 500);
    }

    #[tokio::test]
    async fn test_mock_disconnect_and_open_limit() {
        let transport = MockTransport::new(Duration::ZERO)
            .with_disconnect_after(1)
            .with_open_limit(1);
        let mut conn = transport.open(&url()).await.unwrap();
        assert!(transport.open(&url()).await.is_err());

        assert!(conn.send_get(&url()).await.is_ok());
        assert!(matches!(
            conn.send_get(&url()).await,
            Err(TransportError::Disconnected(_))
        ));

        conn.close();
        conn.close();
        assert_eq!(transport.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_timeouts_keep_the_connection() {
        let transport = MockTransport::new(Duration::from_millis(1)).with_timeout_every(2);
        let mut conn = transport.open(&url()).await.unwrap();

        assert!(conn.send_get(&url()).await.is_ok());
        assert_eq!(conn.send_get(&url()).await, Err(TransportError::Timeout));
        assert!(conn.send_get(&url()).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_timeout_maps_to_timeout() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let transport = HttpTransport::new(Some(Duration::from_millis(100)));
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = transport.open(&url).await.err().unwrap();
        assert_eq!(err, TransportError::Timeout);
        server.abort();
    }

    #[tokio::test]
    async fn test_http_refused_maps_to_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Some(Duration::from_secs(1)));
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = transport.open(&url).await.err().unwrap();
        assert!(matches!(err, TransportError::Disconnected(_)), "{err:?}");
    }
}
