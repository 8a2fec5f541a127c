//! Lariat - HTTP/1.1 and WebSocket client engine
//!
//! This crate provides the protocol and transport core of an HTTP/1.1 and
//! WebSocket client: connection pooling with per-origin reuse, stateful
//! sessions with cookies, auth, hooks, and redirect handling, streaming
//! upload and download, and an RFC 6455 WebSocket client with optional
//! auto-reconnect. Blocking and async (tokio) interfaces share the same
//! protocol core.
//!
//! # Examples
//!
//! ```no_run
//! use lariat::Session;
//!
//! let mut session = Session::new();
//! let mut response = session
//!     .get("http://example.com/")
//!     .header("Accept", "text/html")
//!     .send()
//!     .unwrap();
//! assert_eq!(response.status(), 200);
//! println!("{}", response.text().unwrap());
//! ```
//!
//! Async twin:
//!
//! ```no_run
//! use lariat::AsyncSession;
//!
//! # async fn run() -> lariat::Result<()> {
//! let mut session = AsyncSession::new();
//! let mut response = session.get("http://example.com/").send().await?;
//! let body = response.body().await?;
//! # Ok(())
//! # }
//! ```
//!
//! WebSocket:
//!
//! ```no_run
//! use lariat::{Message, Session};
//!
//! let session = Session::new();
//! let mut ws = session.websocket("ws://example.com/live").build().unwrap();
//! ws.connect().unwrap();
//! ws.send("hello").unwrap();
//! if let Ok(Message::Text(reply)) = ws.recv() {
//!     println!("{}", reply);
//! }
//! ```

pub mod client;
pub mod error;
pub mod http;
pub mod timing;
pub mod transport;
pub mod url;
pub mod ws;

pub use client::{
    AsyncRequestBuilder, AsyncResponse, AsyncSession, AsyncSessionBuilder, Auth, CookieJar,
    RequestBuilder, Response, Session, SessionBuilder,
};
pub use error::{Error, Result};
pub use http::{Body, Headers, Limits, Method};
pub use timing::{Deadline, Timeout};
pub use transport::{AsyncConnectionPool, ConnectionPool, PoolConfig};
pub use url::{Origin, Scheme, Url};
pub use ws::{AsyncWebSocket, Message, WebSocket, WebSocketBuilder, WsState};
