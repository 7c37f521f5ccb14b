pub mod encoding;
pub mod http;
pub mod id;
pub mod mime;
