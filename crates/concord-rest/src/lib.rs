//! Rate-limit-aware REST dispatcher.
//!
//! Serializes calls per normalized route, tracks the server's quota
//! headers, honors account-wide throttling, and retries transient
//! failures internally. Callers submit a request and receive either the
//! decoded response or a terminal error; 429s are never surfaced.
//!
//! Entry point is [`RequestDispatcher`], built from a [`RestConfig`].

#![warn(missing_docs)]

mod bucket;
mod dispatcher;
mod error;
mod latency;
mod routes;

pub use dispatcher::{RequestDispatcher, ResponseBody, RestConfig};
pub use reqwest::Method;
pub use error::RestError;
pub use routes::Route;
