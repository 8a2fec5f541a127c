//! Client layer: sessions, requests, responses.
//!
//! The two session twins orchestrate a request through composition,
//! cookies, auth, hooks, and the redirect engine, on top of the transport
//! pool. The request/response plumbing they share lives in the sibling
//! modules.

pub mod async_response;
pub mod async_session;
pub mod auth;
pub mod cookies;
pub(crate) mod request;
pub mod response;
pub mod session;

pub use async_response::AsyncResponse;
pub use async_session::{AsyncRequestBuilder, AsyncSession, AsyncSessionBuilder, HookFuture};
pub use auth::Auth;
pub use cookies::CookieJar;
pub use response::{ContentIter, LinesIter, Response};
pub use session::{RequestBuilder, Session, SessionBuilder, DEFAULT_MAX_REDIRECTS};
