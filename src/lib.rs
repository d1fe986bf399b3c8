pub mod adapter;
pub mod cli;
pub mod config;
pub mod protocol;
pub mod storage;
pub mod tree;

pub use cli::{Command, prompt};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Client, NetconfServer, Request, Response};
pub use storage::{DatastoreId, DatastoreManager};
