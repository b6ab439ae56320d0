//! Installable client features.
//!
//! [`send::HttpSend`] and, unless disabled, [`redirect::HttpRedirect`] are
//! installed on every client. Everything else is opt-in through
//! [`HttpClientBuilder::install`](crate::client::HttpClientBuilder::install).

pub mod cache;
pub mod cookies;
pub mod default_request;
pub mod logging;
pub mod redirect;
pub mod send;
pub mod timeout;
pub mod validation;

pub use self::cache::HttpCache;
pub use self::cookies::HttpCookies;
pub use self::default_request::DefaultRequest;
pub use self::logging::HttpLogging;
pub use self::redirect::HttpRedirect;
pub use self::send::HttpSend;
pub use self::timeout::HttpTimeout;
pub use self::validation::HttpResponseValidator;
