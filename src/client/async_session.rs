//! Async HTTP session.
//!
//! Twin of the blocking [`Session`](super::session::Session) driven by
//! tokio. The composition, redirect, and cookie logic is the same; hooks
//! may be either synchronous closures or async functions.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use super::async_response::AsyncResponse;
use super::auth::Auth;
use super::cookies::CookieJar;
use super::request;
use super::response::Response;
use super::session::{rewrite_method, DEFAULT_MAX_REDIRECTS};
use crate::error::{Error, Result};
use crate::http::{Body, Headers, Limits, Method};
use crate::timing::{Deadline, Timeout};
use crate::transport::{AsyncConnectionPool, PoolConfig};
use crate::url::Url;
use crate::ws::WebSocketBuilder;

/// Boxed future returned by async hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

enum PreRequestHook {
    Sync(Box<dyn FnMut(Method, Url, Headers) -> Result<(Method, Url, Headers)> + Send>),
    Async(Box<dyn FnMut(Method, Url, Headers) -> HookFuture<(Method, Url, Headers)> + Send>),
}

enum PostResponseHook {
    Sync(Box<dyn FnMut(AsyncResponse) -> Result<AsyncResponse> + Send>),
    Async(Box<dyn FnMut(AsyncResponse) -> HookFuture<AsyncResponse> + Send>),
}

/// Async HTTP session.
///
/// Concurrent requests on one session are allowed; the session's own
/// mutable state (headers, cookies, hooks, auth) is not protected, so
/// mutation requires exclusive access. Pool operations are internally
/// serialized.
pub struct AsyncSession {
    pool: AsyncConnectionPool,
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

impl AsyncSession {
    /// A session with all defaults.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> AsyncSessionBuilder {
        AsyncSessionBuilder::default()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

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

    /// Register a synchronous pre-request hook.
    pub fn add_pre_request_hook<F>(&mut self, hook: F)
    where
        F: FnMut(Method, Url, Headers) -> Result<(Method, Url, Headers)> + Send + 'static,
    {
        self.pre_hooks.push(PreRequestHook::Sync(Box::new(hook)));
    }

    /// Register an async pre-request hook.
    pub fn add_async_pre_request_hook<F>(&mut self, hook: F)
    where
        F: FnMut(Method, Url, Headers) -> HookFuture<(Method, Url, Headers)> + Send + 'static,
    {
        self.pre_hooks.push(PreRequestHook::Async(Box::new(hook)));
    }

    /// Register a synchronous post-response hook.
    pub fn add_post_response_hook<F>(&mut self, hook: F)
    where
        F: FnMut(AsyncResponse) -> Result<AsyncResponse> + Send + 'static,
    {
        self.post_hooks.push(PostResponseHook::Sync(Box::new(hook)));
    }

    /// Register an async post-response hook.
    pub fn add_async_post_response_hook<F>(&mut self, hook: F)
    where
        F: FnMut(AsyncResponse) -> HookFuture<AsyncResponse> + Send + 'static,
    {
        self.post_hooks.push(PostResponseHook::Async(Box::new(hook)));
    }

    /// The connection pool.
    pub fn pool(&self) -> &AsyncConnectionPool {
        &self.pool
    }

    pub fn get(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Get, url)
    }

    pub fn post(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Post, url)
    }

    pub fn put(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Put, url)
    }

    pub fn patch(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Patch, url)
    }

    pub fn delete(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Delete, url)
    }

    pub fn head(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Head, url)
    }

    pub fn options(&mut self, url: &str) -> AsyncRequestBuilder<'_> {
        self.request(Method::Options, url)
    }

    /// Start building a request with an arbitrary supported method.
    pub fn request(&mut self, method: Method, url: &str) -> AsyncRequestBuilder<'_> {
        AsyncRequestBuilder {
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
    /// any headers set on the builder; finish with
    /// [`WebSocketBuilder::build_async`].
    pub fn websocket(&self, url: &str) -> WebSocketBuilder {
        WebSocketBuilder::new(url, self.headers.clone(), self.timeout)
    }

    /// Drop all idle connections. Idempotent.
    pub fn close(&mut self) {
        self.pool.close_all();
    }

    fn resolve_url(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(u) => Ok(u),
            Err(e) => match &self.base_url {
                Some(base) => base.join(url),
                None => Err(e),
            },
        }
    }

    async fn execute(
        &mut self,
        method: Method,
        url: &str,
        req_headers: Headers,
        mut body: Body,
        timeout: Option<Timeout>,
        allow_redirects: bool,
        max_redirects: usize,
    ) -> Result<AsyncResponse> {
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

        let mut headers = self.headers.clone();
        headers.merge(&req_headers);
        if !headers.contains("Authorization") {
            if let Some(auth) = &self.auth {
                headers.set("Authorization", auth.header_value())?;
            }
        }

        let mut method = method;
        for hook in &mut self.pre_hooks {
            let (m, u, h) = match hook {
                PreRequestHook::Sync(f) => f(method, url.clone(), headers.clone())?,
                PreRequestHook::Async(f) => f(method, url.clone(), headers.clone()).await?,
            };
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

            let mut guard = self.pool.acquire(&url.origin(), &timeout, &deadline).await?;
            let (head, leftover) = request::send_request_async(
                &mut guard,
                method,
                &url,
                &hop_headers,
                &mut body,
                &timeout,
                &deadline,
                &self.limits,
            )
            .await?;

            for set_cookie in head.headers.get_all("Set-Cookie") {
                self.cookies.store(&url.origin(), set_cookie);
            }

            let follow =
                allow_redirects && head.is_redirect() && head.headers.contains("Location");
            if !follow {
                let mut response = AsyncResponse::from_wire(
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
                    response = match hook {
                        PostResponseHook::Sync(f) => f(response)?,
                        PostResponseHook::Async(f) => f(response).await?,
                    };
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

            let intermediate = AsyncResponse::from_wire(
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
            history.push(intermediate.into_buffered().await?);

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

impl Default for AsyncSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`AsyncSession`].
#[derive(Default)]
pub struct AsyncSessionBuilder {
    base_url: Option<String>,
    timeout: Option<Timeout>,
    pool: PoolConfig,
    limits: Limits,
    decompress: Option<bool>,
    headers: Headers,
}

impl AsyncSessionBuilder {
    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = Some(url.to_string());
        self
    }

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
        let _ = self.headers.set(name, value);
        self
    }

    pub fn build(self) -> AsyncSession {
        let base_url = self.base_url.as_deref().and_then(|u| Url::parse(u).ok());
        AsyncSession {
            pool: AsyncConnectionPool::new(self.pool),
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

/// Builder for a single request on an [`AsyncSession`].
pub struct AsyncRequestBuilder<'a> {
    session: &'a mut AsyncSession,
    method: Method,
    url: String,
    headers: Headers,
    body: Body,
    timeout: Option<Timeout>,
    allow_redirects: bool,
    max_redirects: usize,
    pending_err: Option<Error>,
}

impl AsyncRequestBuilder<'_> {
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
    pub async fn send(self) -> Result<AsyncResponse> {
        if let Some(e) = self.pending_err {
            return Err(e);
        }
        self.session
            .execute(
                self.method,
                &self.url,
                self.headers,
                self.body,
                self.timeout,
                self.allow_redirects,
                self.max_redirects,
            )
            .await
    }
}
