mod body;
pub(crate) mod codec;
mod dispatch;
mod forward;
mod respond;
mod server;
pub(crate) mod upstream;

pub use body::BodyTooLarge;
pub use forward::HttpTransport;
pub use respond::{send_response, shutdown_stream};
pub use server::handle_http;
