//! Agent backend dispatch:
//! - request and reply payloads with the dispatch error taxonomy
//! - [`Responder`] trait at the seam
//! - reqwest implementation for the `/chat` endpoint

pub mod http;
pub mod transport;

pub use http::HttpResponder;
pub use transport::{
    DispatchFuture, DispatchRequest, Responder, ResponderError, ResponderReply, ResponderResult,
};
