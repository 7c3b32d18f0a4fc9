#![allow(dead_code)]

pub mod dirs;
pub mod harness;
pub mod http_utils;
pub mod upstream;

pub use dirs::TestDirs;
pub use harness::{ProxyHarness, ProxyHarnessBuilder};
pub use http_utils::{TestResponse, send_raw, send_request};
pub use upstream::{MockUpstream, RecordedRequest};
