#![forbid(unsafe_code)]

mod frame;
mod reply;
mod request;

pub use frame::Frame;
pub use request::{IntoArg, Request};
