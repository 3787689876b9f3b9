use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use serde::{Deserialize, Serialize};

use crate::connector::ProxyConfig;
use crate::error::Error;
use crate::rate_limit::RateLimiter;
use crate::tls::TlsOptions;
use crate::util::{parse_header_name, parse_header_value};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/100.0.4896.162 Safari/537.36 Flag/1.0";

const DEFAULT_ALLOW_METHODS: [&str; 11] = [
    "HEAD", "GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "CONNECT", "TRACE", "MOVE", "PURGE",
];

/// Client configuration.
///
/// Timeouts are whole seconds; zero disables the corresponding timeout.
///
/// `Clone` copies every map and list but shares the rate limiter: clients built from
/// clones of the same options draw from one token bucket. Call
/// [`set_limiter`](Self::set_limiter) on a clone to give it its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub proxy: Option<String>,
    /// Sent as `Proxy-Authorization` to the proxy, e.g. `Basic dXNlcjpwYXNz`.
    pub proxy_authorization: Option<String>,
    pub dial_timeout: u64,
    pub read_timeout: u64,
    pub idle_conn_timeout: u64,
    pub tls_handshake_timeout: u64,
    pub max_conns_per_host: usize,
    pub max_idle_conns: usize,
    pub enable_http2: bool,
    pub fail_retries: usize,
    pub retry_wait_min_ms: u64,
    pub retry_wait_max_ms: u64,
    pub max_redirect: usize,
    pub max_resp_body_size: usize,
    pub max_qps: f64,
    pub allow_methods: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub tls: TlsOptions,
    #[serde(rename = "http_debug")]
    pub debug: bool,
    pub disable_keep_alives: bool,
    pub solo_conn: bool,
    #[serde(skip, default)]
    limiter: Option<Arc<RateLimiter>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let mut options = Self {
            proxy: None,
            proxy_authorization: None,
            dial_timeout: 3,
            read_timeout: 10,
            idle_conn_timeout: 60,
            tls_handshake_timeout: 5,
            max_conns_per_host: 50,
            max_idle_conns: 50,
            enable_http2: false,
            fail_retries: 0,
            retry_wait_min_ms: 1_000,
            retry_wait_max_ms: 30_000,
            max_redirect: 10,
            max_resp_body_size: 2 << 20,
            max_qps: 500.0,
            allow_methods: DEFAULT_ALLOW_METHODS.map(str::to_owned).to_vec(),
            headers: BTreeMap::from([("User-Agent".to_owned(), DEFAULT_USER_AGENT.to_owned())]),
            cookies: BTreeMap::new(),
            tls: TlsOptions::default(),
            debug: false,
            disable_keep_alives: false,
            solo_conn: false,
            limiter: None,
        };
        options.set_limiter();
        options
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh rate limiter from `max_qps` with a burst of one.
    ///
    /// Deserialized options carry no limiter until this is called.
    pub fn set_limiter(&mut self) -> &mut Self {
        self.limiter = Some(Arc::new(RateLimiter::per_second(self.max_qps)));
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    pub fn with_max_qps(mut self, max_qps: f64) -> Self {
        self.max_qps = max_qps;
        self.set_limiter();
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_proxy_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.proxy_authorization = Some(authorization.into());
        self
    }

    pub fn with_timeouts(mut self, dial_timeout: u64, read_timeout: u64) -> Self {
        self.dial_timeout = dial_timeout;
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_max_conns_per_host(mut self, max_conns_per_host: usize) -> Self {
        self.max_conns_per_host = max_conns_per_host;
        self
    }

    pub fn with_http2(mut self, enable_http2: bool) -> Self {
        self.enable_http2 = enable_http2;
        self
    }

    pub fn with_fail_retries(mut self, fail_retries: usize) -> Self {
        self.fail_retries = fail_retries;
        self
    }

    pub fn with_retry_wait(mut self, min: Duration, max: Duration) -> Self {
        self.retry_wait_min_ms = min.as_millis().min(u64::MAX as u128) as u64;
        self.retry_wait_max_ms = max.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_max_redirect(mut self, max_redirect: usize) -> Self {
        self.max_redirect = max_redirect;
        self
    }

    pub fn with_max_resp_body_size(mut self, max_resp_body_size: usize) -> Self {
        self.max_resp_body_size = max_resp_body_size;
        self
    }

    pub fn with_allow_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_disable_keep_alives(mut self, disable_keep_alives: bool) -> Self {
        self.disable_keep_alives = disable_keep_alives;
        self
    }

    pub fn with_solo_conn(mut self, solo_conn: bool) -> Self {
        self.solo_conn = solo_conn;
        self
    }

    /// Checks that the options can build a client.
    pub fn verify(&self) -> Result<(), Error> {
        if self.limiter.is_none() {
            return Err(Error::configuration(
                "rate limiter is not set; call ClientOptions::set_limiter",
            ));
        }
        if self.max_resp_body_size == 0 {
            return Err(Error::configuration("max_resp_body_size must be positive"));
        }
        if self.retry_wait_min_ms > self.retry_wait_max_ms {
            return Err(Error::configuration(
                "retry_wait_min_ms must not exceed retry_wait_max_ms",
            ));
        }
        for method in &self.allow_methods {
            Method::from_bytes(method.as_bytes()).map_err(|_| Error::InvalidMethod {
                method: method.clone(),
            })?;
        }
        for (name, value) in &self.headers {
            parse_header_name(name)?;
            parse_header_value(name, value)?;
        }
        self.proxy_config()?;
        Ok(())
    }

    pub(crate) fn is_method_allowed(&self, method: &Method) -> bool {
        self.allow_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
    }

    pub(crate) fn proxy_config(&self) -> Result<Option<ProxyConfig>, Error> {
        match self.proxy.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(proxy) => {
                ProxyConfig::parse(proxy, self.proxy_authorization.as_deref()).map(Some)
            }
        }
    }

    pub(crate) fn retry_wait_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.retry_wait_min_ms),
            Duration::from_millis(self.retry_wait_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::Method;

    use super::{ClientOptions, DEFAULT_USER_AGENT};
    use crate::error::Error;
    use crate::tls::TlsVersion;

    #[test]
    fn defaults_match_documented_values() {
        let options = ClientOptions::default();
        assert_eq!(options.dial_timeout, 3);
        assert_eq!(options.read_timeout, 10);
        assert_eq!(options.idle_conn_timeout, 60);
        assert_eq!(options.max_conns_per_host, 50);
        assert_eq!(options.max_redirect, 10);
        assert_eq!(options.max_resp_body_size, 2 << 20);
        assert_eq!(options.fail_retries, 0);
        assert_eq!(
            options.headers.get("User-Agent").map(String::as_str),
            Some(DEFAULT_USER_AGENT)
        );
        assert!(options.is_method_allowed(&Method::from_bytes(b"PURGE").expect("valid method")));
        assert!(options.tls.skip_verify);
        options.verify().expect("default options should verify");
    }

    #[test]
    fn clone_copies_maps_and_shares_limiter() {
        let options = ClientOptions::default().with_header("X-Team", "core");
        let mut cloned = options.clone();
        cloned.headers.insert("X-Team".to_owned(), "edge".to_owned());
        cloned.allow_methods.clear();

        assert_eq!(options.headers.get("X-Team").map(String::as_str), Some("core"));
        assert!(!options.allow_methods.is_empty());
        let (Some(left), Some(right)) = (options.limiter(), cloned.limiter()) else {
            panic!("both options should carry a limiter");
        };
        assert!(Arc::ptr_eq(left, right));

        cloned.set_limiter();
        let Some(replaced) = cloned.limiter() else {
            panic!("limiter should be set");
        };
        assert!(!Arc::ptr_eq(left, replaced));
    }

    #[test]
    fn deserialized_options_need_a_limiter() {
        let mut options: ClientOptions = serde_json::from_value(serde_json::json!({
            "dial_timeout": 1,
            "read_timeout": 2,
            "fail_retries": 3,
            "max_qps": 20.0,
            "http_debug": true,
            "headers": { "Accept": "application/json" },
            "cookies": { "clientcookieid1": "id1" },
            "tls": { "skip_verify": false, "min_version": "tls1.2" }
        }))
        .expect("options should deserialize");

        assert_eq!(options.dial_timeout, 1);
        assert_eq!(options.fail_retries, 3);
        assert!(options.debug);
        assert_eq!(options.max_redirect, 10);
        assert_eq!(options.tls.min_version, TlsVersion::Tls12);
        assert!(!options.headers.contains_key("User-Agent"));

        match options.verify() {
            Err(Error::Configuration { message }) => assert!(message.contains("rate limiter")),
            other => panic!("unexpected verify result: {other:?}"),
        }
        options.set_limiter();
        options.verify().expect("options with limiter should verify");
        let policy = options.limiter().expect("limiter set").policy();
        assert_eq!(policy.configured_requests_per_second(), 20.0);
    }

    #[test]
    fn verify_rejects_bad_proxy_and_methods() {
        let options = ClientOptions::default().with_proxy("socks5://127.0.0.1:1080");
        assert!(matches!(options.verify(), Err(Error::Configuration { .. })));

        let options = ClientOptions::default().with_allow_methods(["GET", "BAD METHOD"]);
        assert!(matches!(options.verify(), Err(Error::InvalidMethod { .. })));
    }
}
