use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::Uri;
use http::header::HeaderValue;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::dns::{GaiAddrs, GaiResolver, Name};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tokio::time::timeout;
use tower_service::Service;
use url::Url;

use crate::error::{BoxError, Error};
use crate::trace::active_recorder;

type Connecting<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

/// Forward proxy every connection is routed through.
#[derive(Clone, Debug)]
pub(crate) struct ProxyConfig {
    pub(crate) uri: Uri,
    pub(crate) authorization: Option<HeaderValue>,
}

impl ProxyConfig {
    pub(crate) fn parse(proxy: &str, authorization: Option<&str>) -> Result<Self, Error> {
        let parsed = Url::parse(proxy.trim())
            .map_err(|source| Error::configuration(format!("invalid proxy url {proxy}: {source}")))?;
        if parsed.scheme() != "http" || parsed.host_str().is_none() {
            return Err(Error::configuration(format!(
                "unsupported proxy url {proxy}: expected http://host[:port]"
            )));
        }
        let uri = parsed
            .as_str()
            .parse::<Uri>()
            .map_err(|source| Error::configuration(format!("invalid proxy url {proxy}: {source}")))?;
        let authorization = authorization
            .map(|value| {
                let mut value = HeaderValue::from_str(value).map_err(|source| {
                    Error::InvalidHeaderValue {
                        name: "proxy-authorization".to_owned(),
                        source,
                    }
                })?;
                value.set_sensitive(true);
                Ok::<_, Error>(value)
            })
            .transpose()?;
        Ok(Self { uri, authorization })
    }
}

fn is_https(uri: &Uri) -> bool {
    uri.scheme_str()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"))
}

/// System resolver that reports lookup boundaries to the active trace.
#[derive(Clone)]
pub(crate) struct TraceResolver {
    inner: GaiResolver,
}

impl TraceResolver {
    pub(crate) fn new() -> Self {
        Self {
            inner: GaiResolver::new(),
        }
    }
}

impl Service<Name> for TraceResolver {
    type Response = GaiAddrs;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<GaiAddrs, io::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let recorder = active_recorder();
        if let Some(recorder) = &recorder {
            recorder.dns_start();
        }
        let resolving = self.inner.call(name);
        Box::pin(async move {
            let resolved = resolving.await;
            if let Some(recorder) = recorder {
                recorder.dns_done();
                recorder.connect_start();
            }
            resolved
        })
    }
}

type TcpConnector = HttpConnector<TraceResolver>;
type TcpStream = <TcpConnector as Service<Uri>>::Response;

#[derive(Debug)]
pub(crate) struct ProxyConnection<T> {
    inner: T,
    proxied: bool,
}

impl<T> ProxyConnection<T> {
    fn new(inner: T, proxied: bool) -> Self {
        Self { inner, proxied }
    }
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.proxied)
    }
}

#[derive(Clone)]
struct ProxyRuntime {
    tunnel: Tunnel<TcpConnector>,
    proxy_uri: Uri,
}

/// TCP dialer, either direct or through the configured proxy.
///
/// https targets are tunneled with `CONNECT`; plain http requests go to the proxy
/// itself in absolute form.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: TcpConnector,
    proxy: Option<ProxyRuntime>,
}

impl ProxyConnector {
    pub(crate) fn new(proxy_config: Option<ProxyConfig>, connect_timeout: Option<Duration>) -> Self {
        let mut direct = HttpConnector::new_with_resolver(TraceResolver::new());
        direct.enforce_http(false);
        direct.set_nodelay(true);
        direct.set_connect_timeout(connect_timeout);
        let proxy = proxy_config.map(|config| {
            let mut tunnel = Tunnel::new(config.uri.clone(), direct.clone());
            if let Some(authorization) = config.authorization {
                tunnel = tunnel.with_auth(authorization);
            }
            ProxyRuntime {
                tunnel,
                proxy_uri: config.uri,
            }
        });
        Self { direct, proxy }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<TcpStream>;
    type Error = BoxError;
    type Future = Connecting<Self::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if let Some(proxy) = &mut self.proxy {
            let direct_ready = match self.direct.poll_ready(cx) {
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
                Poll::Pending => false,
            };
            let tunnel_ready = match proxy.tunnel.poll_ready(cx) {
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
                Poll::Pending => false,
            };
            return if direct_ready && tunnel_ready {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            };
        }

        match self.direct.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let recorder = active_recorder();
        let started_at = Instant::now();
        let tls = is_https(&dst);

        let (connecting, proxied): (Connecting<TcpStream>, bool) = match &mut self.proxy {
            Some(proxy) if tls => {
                let connecting = proxy.tunnel.call(normalize_tunnel_target_uri(dst));
                (
                    Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) }),
                    false,
                )
            }
            Some(proxy) => {
                let connecting = self.direct.call(proxy.proxy_uri.clone());
                (
                    Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) }),
                    true,
                )
            }
            None => {
                let connecting = self.direct.call(dst);
                (
                    Box::pin(async move { connecting.await.map_err(|error| Box::new(error) as _) }),
                    false,
                )
            }
        };

        Box::pin(async move {
            let connection = connecting.await?;
            if let Some(recorder) = recorder {
                recorder.tcp_connected(started_at, tls);
            }
            Ok(ProxyConnection::new(connection, proxied))
        })
    }
}

pub(crate) fn normalize_tunnel_target_uri(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }

    let Some(scheme) = dst.scheme_str() else {
        return dst;
    };
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        443
    } else if scheme.eq_ignore_ascii_case("http") {
        80
    } else {
        return dst;
    };
    let Some(host) = dst.host() else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{default_port}")
    } else {
        format!("{host}:{default_port}")
    };

    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}

#[derive(Debug, thiserror::Error)]
#[error("connect to {target} timed out after {timeout_ms}ms")]
struct ConnectTimedOut {
    target: String,
    timeout_ms: u128,
}

/// Outermost connector layer: bounds dial plus TLS handshake and marks the
/// connection as established on the active trace.
#[derive(Clone)]
pub(crate) struct TraceConnector<C> {
    inner: C,
    dial_timeout: Option<Duration>,
    tls_handshake_timeout: Option<Duration>,
}

impl<C> TraceConnector<C> {
    pub(crate) fn new(
        inner: C,
        dial_timeout: Option<Duration>,
        tls_handshake_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            dial_timeout,
            tls_handshake_timeout,
        }
    }

    fn budget(&self, tls: bool) -> Option<Duration> {
        match (self.dial_timeout, tls.then_some(self.tls_handshake_timeout).flatten()) {
            (Some(dial), Some(handshake)) => Some(dial + handshake),
            (Some(dial), None) => Some(dial),
            (None, _) => None,
        }
    }
}

impl<C> Service<Uri> for TraceConnector<C>
where
    C: Service<Uri>,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Connecting<C::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let recorder = active_recorder();
        let tls = is_https(&dst);
        let budget = self.budget(tls);
        let target = dst.authority().map(ToString::to_string).unwrap_or_default();
        let connecting = self.inner.call(dst);

        Box::pin(async move {
            let connected = match budget {
                Some(budget) => match timeout(budget, connecting).await {
                    Ok(connected) => connected,
                    Err(_) => {
                        return Err(Box::new(ConnectTimedOut {
                            target,
                            timeout_ms: budget.as_millis(),
                        }) as BoxError);
                    }
                },
                None => connecting.await,
            };
            let connection = connected.map_err(Into::into)?;
            if let Some(recorder) = recorder {
                recorder.connection_ready(tls);
            }
            Ok(connection)
        })
    }
}
