//! Core of the verve dispatcher: event broker, lifecycle service, PR
//! reconciler, and the worker loop.
//!
//! The HTTP/SSE surface lives in `verve-cli`; persistence lives in
//! `verve-db`. Everything here is transport-agnostic.

pub mod creds;
pub mod event;
pub mod reconciler;
pub mod service;
pub mod worker;
