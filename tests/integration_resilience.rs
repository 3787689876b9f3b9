use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use shttp::prelude::{Client, ClientOptions, Error, Request};
use shttp::{CancelPhase, ErrorCode, TransportErrorKind};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static str,
}

impl MockResponse {
    fn new(status: u16, headers: Vec<(&'static str, &'static str)>, body: &'static str) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let served_clone = Arc::clone(&served);
        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(3);
            let mut response_index = 0;

            while response_index < responses.len() && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        if read_request_head(&mut stream).is_err() {
                            continue;
                        }
                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let _ = write_response(&mut stream, &responses[response_index]);
                        response_index += 1;
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request_head(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    let mut raw = Vec::new();
    while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        raw.extend_from_slice(&chunk[..read]);
    }
    Ok(())
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");
    raw.push_str(response.body);

    stream.write_all(raw.as_bytes())?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn retry_options(fail_retries: usize, min: Duration, max: Duration) -> ClientOptions {
    ClientOptions::default()
        .with_timeouts(1, 2)
        .with_fail_retries(fail_retries)
        .with_retry_wait(min, max)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn too_many_requests_without_retries_is_exhausted_after_one_attempt() {
    let server = MockServer::start(vec![MockResponse::new(
        429,
        vec![("Content-Type", "application/json")],
        r#"{ "message": "too many" }"#,
    )]);
    let client = Client::new(ClientOptions::default().with_fail_retries(0), None)
        .expect("client should build");

    let mut request = Request::parse("GET", &server.url("/limited")).expect("valid request");
    let error = client
        .execute(&CancellationToken::new(), &mut request)
        .await
        .expect_err("429 should not be returned as success");
    assert_eq!(error.code(), ErrorCode::RetryExhausted);
    match error {
        Error::RetryExhausted {
            method,
            attempts,
            source,
            ..
        } => {
            assert_eq!(method, Method::GET);
            assert_eq!(attempts, 1);
            match *source {
                Error::UnexpectedStatus { status, .. } => {
                    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS)
                }
                other => panic!("unexpected retry source: {other}"),
            }
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_use_exactly_fail_retries_plus_one_attempts() {
    let server = MockServer::start(vec![MockResponse::new(503, Vec::new(), "down"); 3]);
    let client = Client::new(
        retry_options(2, Duration::from_millis(10), Duration::from_millis(20)),
        None,
    )
    .expect("client should build");

    let mut request = Request::parse("GET", &server.url("/down")).expect("valid request");
    let error = client
        .execute(&CancellationToken::new(), &mut request)
        .await
        .expect_err("every attempt fails");
    match error {
        Error::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(request.attempt(), 3);
    assert_eq!(server.served_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_after_is_capped_by_max_wait_and_success_ends_the_loop() {
    let server = MockServer::start(vec![
        MockResponse::new(503, vec![("Retry-After", "120")], "busy"),
        MockResponse::new(500, Vec::new(), "oops"),
        MockResponse::new(200, Vec::new(), "recovered"),
    ]);
    let client = Client::new(
        retry_options(3, Duration::from_millis(10), Duration::from_millis(50)),
        None,
    )
    .expect("client should build");

    let started = Instant::now();
    let mut request = Request::parse("GET", &server.url("/flaky")).expect("valid request");
    let response = client
        .execute(&CancellationToken::new(), &mut request)
        .await
        .expect("third attempt should succeed");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(response.text_lossy(), "recovered");
    assert_eq!(response.request().attempt(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_backoff_returns_before_the_wait_ends() {
    let server = MockServer::start(vec![MockResponse::new(503, Vec::new(), "down")]);
    let client = Client::new(
        retry_options(3, Duration::from_secs(5), Duration::from_secs(10)),
        None,
    )
    .expect("client should build");

    let token = CancellationToken::new();
    let canceler = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceler.cancel();
    });

    let started = Instant::now();
    let mut request = Request::parse("GET", &server.url("/down")).expect("valid request");
    let error = client
        .execute(&token, &mut request)
        .await
        .expect_err("cancellation should end the call");
    assert!(started.elapsed() < Duration::from_secs(2));
    match error {
        Error::Canceled {
            phase, attempts, ..
        } => {
            assert_eq!(phase, CancelPhase::Backoff);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canceled_token_stops_the_call_at_the_rate_limiter() {
    let client = Client::new_default(None).expect("client should build");
    let token = CancellationToken::new();
    token.cancel();

    let mut request = Request::parse("GET", "http://127.0.0.1:9/never").expect("valid request");
    let error = client
        .execute(&token, &mut request)
        .await
        .expect_err("canceled token should stop the call");
    assert_eq!(error.code(), ErrorCode::RateLimitCanceled);
    assert_eq!(request.attempt(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limiter_spaces_calls_sharing_options() {
    let server = MockServer::start(vec![
        MockResponse::new(200, Vec::new(), "one"),
        MockResponse::new(200, Vec::new(), "two"),
    ]);
    let options = ClientOptions::default().with_timeouts(1, 2).with_max_qps(4.0);
    let first = Client::new(options.clone(), None).expect("client should build");
    let second = Client::new(options, None).expect("client should build");

    let started = Instant::now();
    for client in [&first, &second] {
        let mut request = Request::parse("GET", &server.url("/paced")).expect("valid request");
        client
            .execute(&CancellationToken::new(), &mut request)
            .await
            .expect("request should succeed");
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connections_are_retried_as_connect_failures() {
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
        listener.local_addr().expect("read local address")
    };
    let client = Client::new(
        retry_options(1, Duration::from_millis(10), Duration::from_millis(10)),
        None,
    )
    .expect("client should build");

    let mut request =
        Request::parse("GET", &format!("http://{address}/closed")).expect("valid request");
    let error = client
        .execute(&CancellationToken::new(), &mut request)
        .await
        .expect_err("nothing listens on the port");
    match error {
        Error::RetryExhausted {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 2);
            match *source {
                Error::Transport { kind, .. } => assert_eq!(kind, TransportErrorKind::Connect),
                other => panic!("unexpected retry source: {other}"),
            }
        }
        other => panic!("unexpected error variant: {other}"),
    }
}
