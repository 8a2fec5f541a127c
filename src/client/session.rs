//! Blocking HTTP session.
//!
//! A [`Session`] owns a connection pool and the per-origin state that
//! outlives a single request: persistent headers, a cookie jar, optional
//! auth, and the two hook lists. Requests flow through the redirect engine
//! in [`Session::execute`]; everything the session mutates is snapshotted
//! at composition time, so mid-flight mutation is never observed by an
//! in-flight request.

use std::collections::HashSet;

use tracing::debug;

use super::auth::Auth;
use super::cookies::CookieJar;
use super::request;
use super::response::Response;
use crate::error::{Error, Result};
use crate::http::{Body, Headers, Limits, Method};
use crate::timing::{Deadline, Timeout};
use crate::transport::{ConnectionPool, PoolConfig};
use crate::url::Url;
use crate::ws::WebSocketBuilder;

/// Default bound on the length of a redirect chain.
pub const DEFAULT_MAX_REDIRECTS: usize = 30;

pub(crate) type PreRequestHook =
    Box<dyn FnMut(Method, Url, Headers) -> Result<(Method, Url, Headers)> + Send>;
pub(crate) type PostResponseHook = Box<dyn FnMut(Response) -> Result<Response> + Send>;

/// Redirect method rewriting per RFC 7231 §6.4 and RFC 7538.
///
/// Returns the method to use for the next hop and whether the body is
/// dropped.
pub(crate) fn rewrite_method(method: Method, status: u16) -> (Method, bool) {
    match status {
        303 => (Method::Get, true),
        301 | 302 => match method {
            Method::Post | Method::Put | Method::Patch => (Method::Get, true),
            other => (other, false),
        },
        _ => (method, false),
    }
}

/// Blocking HTTP session.
///
/// Not safe for concurrent use from multiple threads; callers wanting
/// shared mutation must serialize access themselves. Pool operations are
/// internally serialized.
pub struct Session {
    pool: ConnectionPool,
    headers: Headers,
    cookies: CookieJar,
    auth: Option<Auth>,
    base_url: Option<Url>,
    timeout: Timeout,
    limits: Limits,
    decompress: bool,
    pre_hooks: Vec<PreRequestHook>,
    post_hooks: Vec<PostResponseHook>,
}

impl Session {
    /// A session with all defaults.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Persistent headers sent with every request.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The cookie jar.
    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.cookies
    }

    /// Use Basic authentication on every request. Replaces any Bearer
    /// token.
    pub fn set_basic_auth(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.auth = Some(Auth::Basic {
            username: username.into(),
            password: password.into(),
        });
    }

    /// Use a Bearer token on every request. Replaces any Basic credential.
    pub fn set_bearer_token(&mut self, token: impl Into<String>) {
        self.auth = Some(Auth::Bearer {
            token: token.into(),
        });
    }

    pub fn clear_auth(&mut self) {
        self.auth = None;
    }

    /// Register a hook run before each request is written. Hooks run in
    /// registration order and may rewrite the method, URL, and headers.
    pub fn add_pre_request_hook<F>(&mut self, hook: F)
    where
        F: FnMut(Method, Url, Headers) -> Result<(Method, Url, Headers)> + Send + 'static,
    {
        self.pre_hooks.push(Box::new(hook));
    }

    /// Register a hook run on each response before it is returned. Hooks
    /// run in registration order and may substitute the response.
    pub fn add_post_response_hook<F>(&mut self, hook: F)
    where
        F: FnMut(Response) -> Result<Response> + Send + 'static,
    {
        self.post_hooks.push(Box::new(hook));
    }

    /// The connection pool, exposed for maintenance calls such as
    /// [`ConnectionPool::prune`].
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn get(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Get, url)
    }

    pub fn post(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Post, url)
    }

    pub fn put(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Put, url)
    }

    pub fn patch(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Patch, url)
    }

    pub fn delete(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Delete, url)
    }

    pub fn head(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Head, url)
    }

    pub fn options(&mut self, url: &str) -> RequestBuilder<'_> {
        self.request(Method::Options, url)
    }

    /// Start building a request with an arbitrary supported method.
    pub fn request(&mut self, method: Method, url: &str) -> RequestBuilder<'_> {
        RequestBuilder {
            session: self,
            method,
            url: url.to_string(),
            headers: Headers::new(),
            body: Body::Empty,
            timeout: None,
            allow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            pending_err: None,
        }
    }

    /// Start building a WebSocket client. Session headers are merged under
    /// any headers set on the builder.
    pub fn websocket(&self, url: &str) -> WebSocketBuilder {
        WebSocketBuilder::new(url, self.headers.clone(), self.timeout)
    }

    /// Close all idle connections. Idempotent.
    pub fn close(&mut self) {
        self.pool.close_all();
    }

    pub(crate) fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(u) => Ok(u),
            Err(e) => match &self.base_url {
                Some(base) => base.join(url),
                None => Err(e),
            },
        }
    }

    fn execute(
        &mut self,
        method: Method,
        url: &str,
        req_headers: Headers,
        mut body: Body,
        timeout: Option<Timeout>,
        allow_redirects: bool,
        max_redirects: usize,
    ) -> Result<Response> {
        let mut url = self.resolve_url(url)?;
        if !url.scheme().is_http() {
            return Err(Error::InvalidRequest(format!(
                "{} is not an HTTP URL; use websocket() for ws/wss",
                url
            )));
        }

        let timeout = timeout.unwrap_or(self.timeout);
        let deadline = Deadline::start(timeout.total);
        let body_was_streaming = body.is_streaming();

        // Composition snapshot: session headers under request headers,
        // then auth. Later session mutation is not observed.
        let mut headers = self.headers.clone();
        headers.merge(&req_headers);
        if !headers.contains("Authorization") {
            if let Some(auth) = &self.auth {
                headers.set("Authorization", auth.header_value())?;
            }
        }

        let mut method = method;
        for hook in &mut self.pre_hooks {
            let (m, u, h) = hook(method, url.clone(), headers.clone())?;
            method = m;
            url = u;
            headers = h;
            if !url.scheme().is_http() {
                return Err(Error::InvalidRequest(format!(
                    "hook produced non-HTTP URL: {}",
                    url
                )));
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(url.as_str().to_string());
        let mut history: Vec<Response> = Vec::new();

        loop {
            let mut hop_headers = headers.clone();
            if let Some(cookie) = self.cookies.cookie_header(&url.origin()) {
                hop_headers.set("Cookie", cookie)?;
            }

            let mut guard = self.pool.acquire(&url.origin(), &timeout, &deadline)?;
            let (head, leftover) = request::send_request(
                &mut guard,
                method,
                &url,
                &hop_headers,
                &mut body,
                &timeout,
                &deadline,
                &self.limits,
            )?;

            for set_cookie in head.headers.get_all("Set-Cookie") {
                self.cookies.store(&url.origin(), set_cookie);
            }

            let follow =
                allow_redirects && head.is_redirect() && head.headers.contains("Location");
            if !follow {
                let mut response = Response::from_wire(
                    head,
                    url.clone(),
                    guard,
                    leftover,
                    method,
                    timeout,
                    deadline,
                    self.limits,
                    self.decompress,
                )?;
                response.set_history(history);
                for hook in &mut self.post_hooks {
                    response = hook(response)?;
                }
                return Ok(response);
            }

            if history.len() >= max_redirects {
                return Err(Error::TooManyRedirects {
                    limit: max_redirects,
                    history,
                });
            }

            let location = head
                .headers
                .get("Location")
                .expect("checked above")
                .to_string();
            let next_url = url.join(&location)?;
            if !next_url.scheme().is_http() {
                return Err(Error::InvalidResponse(format!(
                    "redirect to non-HTTP URL: {}",
                    next_url
                )));
            }

            if visited.contains(next_url.as_str()) {
                return Err(Error::RedirectLoop {
                    url: next_url.as_str().to_string(),
                    history,
                });
            }

            let status = head.status;
            let (next_method, drop_body) = rewrite_method(method, status);

            if !drop_body && body_was_streaming {
                return Err(Error::InvalidRequest(
                    "cannot replay a streaming body across redirects".to_string(),
                ));
            }

            // Buffer the intermediate response; draining returns its
            // connection to the pool
            let mut intermediate = Response::from_wire(
                head,
                url.clone(),
                guard,
                leftover,
                method,
                timeout,
                deadline,
                self.limits,
                self.decompress,
            )?;
            intermediate.drain()?;
            history.push(intermediate);

            if next_url.origin() != url.origin() {
                headers.remove("Authorization");
                headers.remove("Cookie");
            }
            if drop_body {
                body = Body::Empty;
                headers.remove("Content-Length");
                headers.remove("Transfer-Encoding");
            }

            debug!(status, from = %url, to = %next_url, "following redirect");
            method = next_method;
            url = next_url;
            visited.insert(url.as_str().to_string());
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    base_url: Option<String>,
    timeout: Option<Timeout>,
    pool: PoolConfig,
    limits: Limits,
    decompress: Option<bool>,
    headers: Headers,
}

impl SessionBuilder {
    /// Base URL that relative request URLs are resolved against.
    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = Some(url.to_string());
        self
    }

    /// Default timeout for every request.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.pool.max_per_host = max;
        self
    }

    pub fn max_total_connections(mut self, max: usize) -> Self {
        self.pool.max_total = max;
        self
    }

    pub fn max_idle_time(mut self, max_idle: std::time::Duration) -> Self {
        self.pool.max_idle = max_idle;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Disable transparent gzip/deflate decompression.
    pub fn no_decompress(mut self) -> Self {
        self.decompress = Some(false);
        self
    }

    /// A persistent header present on every request.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        // Invalid names surface on the first request instead
        let _ = self.headers.set(name, value);
        self
    }

    pub fn build(self) -> Session {
        let base_url = self.base_url.as_deref().and_then(|u| Url::parse(u).ok());
        Session {
            pool: ConnectionPool::new(self.pool),
            headers: self.headers,
            cookies: CookieJar::new(),
            auth: None,
            base_url,
            timeout: self.timeout.unwrap_or_default(),
            limits: self.limits,
            decompress: self.decompress.unwrap_or(true),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }
}

/// Builder for a single request on a [`Session`].
pub struct RequestBuilder<'a> {
    session: &'a mut Session,
    method: Method,
    url: String,
    headers: Headers,
    body: Body,
    timeout: Option<Timeout>,
    allow_redirects: bool,
    max_redirects: usize,
    pending_err: Option<Error>,
}

impl RequestBuilder<'_> {
    /// Set a header for this request, overriding the session value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let Err(e) = self.headers.set(name, value) {
            self.pending_err.get_or_insert(e);
        }
        self
    }

    /// Merge a prepared header map over the request headers.
    pub fn headers(mut self, headers: &Headers) -> Self {
        self.headers.merge(headers);
        self
    }

    /// Attach a request body.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Override the session timeout for this request.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable or disable redirect following (on by default).
    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = allow;
        self
    }

    /// Bound the redirect chain length for this request.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Send the request and return the response.
    pub fn send(self) -> Result<Response> {
        if let Some(e) = self.pending_err {
            return Err(e);
        }
        self.session.execute(
            self.method,
            &self.url,
            self.headers,
            self.body,
            self.timeout,
            self.allow_redirects,
            self.max_redirects,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_method_301_302() {
        for status in [301, 302] {
            assert_eq!(rewrite_method(Method::Post, status), (Method::Get, true));
            assert_eq!(rewrite_method(Method::Put, status), (Method::Get, true));
            assert_eq!(rewrite_method(Method::Patch, status), (Method::Get, true));
            assert_eq!(rewrite_method(Method::Get, status), (Method::Get, false));
            assert_eq!(rewrite_method(Method::Head, status), (Method::Head, false));
            assert_eq!(
                rewrite_method(Method::Delete, status),
                (Method::Delete, false)
            );
        }
    }

    #[test]
    fn test_rewrite_method_303() {
        assert_eq!(rewrite_method(Method::Post, 303), (Method::Get, true));
        assert_eq!(rewrite_method(Method::Get, 303), (Method::Get, true));
        // HEAD rewrites to GET on 303
        assert_eq!(rewrite_method(Method::Head, 303), (Method::Get, true));
    }

    #[test]
    fn test_rewrite_method_307_308() {
        for status in [307, 308] {
            assert_eq!(rewrite_method(Method::Post, status), (Method::Post, false));
            assert_eq!(rewrite_method(Method::Head, status), (Method::Head, false));
        }
    }

    #[test]
    fn test_resolve_url_with_base() {
        let session = Session::builder()
            .base_url("http://api.example/v1/")
            .build();
        assert_eq!(
            session.resolve_url("users").unwrap().as_str(),
            "http://api.example/v1/users"
        );
        assert_eq!(
            session.resolve_url("/abs").unwrap().as_str(),
            "http://api.example/abs"
        );
        assert_eq!(
            session.resolve_url("http://other.example/x").unwrap().as_str(),
            "http://other.example/x"
        );
    }

    #[test]
    fn test_resolve_url_without_base() {
        let session = Session::new();
        assert!(session.resolve_url("/relative").is_err());
        assert!(session.resolve_url("http://a.example/x").is_ok());
    }

    #[test]
    fn test_ws_url_rejected_for_http_request() {
        let mut session = Session::new();
        let err = session.get("ws://a.example/ws").send().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_builder_invalid_header_surfaces_on_send() {
        let mut session = Session::new();
        let err = session
            .get("http://a.example/")
            .header("X-Bad", "v\r\ninjected")
            .send()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHeader(_)));
    }

    #[test]
    fn test_auth_setters_replace() {
        let mut session = Session::new();
        session.set_basic_auth("u", "p");
        session.set_bearer_token("tok");
        assert_eq!(
            session.auth,
            Some(Auth::Bearer {
                token: "tok".to_string()
            })
        );
        session.clear_auth();
        assert!(session.auth.is_none());
    }
}
