// Library root for the display process: re-exports the modules so the binary
// and integration tests share one API.

pub mod app;
pub mod console;
pub mod protocol;
pub mod rest;
pub mod ws_feed;
pub mod ws_server;
