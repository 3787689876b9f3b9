use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use http::HeaderValue;
use url::Url;

/// Cookie storage consulted on every hop of an exchange.
pub trait CookieStore: Send + Sync {
    /// Stores the `Set-Cookie` values received from `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url);
    /// `Cookie` header value to send to `url`, if any cookie matches.
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;
}

/// In-memory [`CookieStore`] following RFC 6265 domain and path matching.
///
/// Clones share the same underlying store.
#[derive(Clone, Default)]
pub struct Jar(Arc<RwLock<cookie_store::CookieStore>>);

impl fmt::Debug for Jar {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("Jar").finish_non_exhaustive()
    }
}

impl Jar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cookie as if `url` had sent it in a `Set-Cookie` header.
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        let cookies = cookie::Cookie::parse(cookie)
            .ok()
            .map(cookie::Cookie::into_owned)
            .into_iter();
        self.store_mut(|store| store.store_response_cookies(cookies, url));
    }

    /// Value of the cookie `name` that would be sent to `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        let store = match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        store
            .get_request_values(url)
            .find(|(cookie_name, _)| *cookie_name == name)
            .map(|(_, value)| value.to_owned())
    }

    fn store_mut(&self, apply: impl FnOnce(&mut cookie_store::CookieStore)) {
        let mut store = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut store);
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let cookies: Vec<_> = cookie_headers
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| {
                cookie::Cookie::parse(value)
                    .map(cookie::Cookie::into_owned)
                    .ok()
            })
            .collect();
        if cookies.is_empty() {
            return;
        }
        self.store_mut(|store| store.store_response_cookies(cookies.into_iter(), url));
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let header = {
            let store = match self.0.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            store
                .get_request_values(url)
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ")
        };

        if header.is_empty() {
            return None;
        }
        HeaderValue::from_maybe_shared(Bytes::from(header)).ok()
    }
}
