pub mod config;
pub mod device;
pub mod explorer;
pub mod history;
pub mod poller;
pub mod rolling;
pub mod samples;
pub mod server;
pub mod stream;
