//! HTTP(S) over the modem's embedded HTTP stack (`AT+QHTTP*`).

pub mod client;
pub mod header;

pub use client::{HttpClient, HttpResponse, HttpSettings, HttpTiming};
pub use header::{append_query, encode_params, Method, RequestHeader, Scheme};
