pub mod ffi;
pub mod maa;
pub mod server;
