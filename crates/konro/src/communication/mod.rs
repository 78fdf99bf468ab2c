//! Request, response, and queue plumbing shared by instances and their
//! execution threads.

mod item_stream;
mod payload;
mod request;

pub use item_stream::ResponseStream;
pub use payload::CompletionCallback;
pub use request::{InferenceRequest, InferenceResponse, Tensor};

pub(crate) use payload::Payload;
