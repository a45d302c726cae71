pub mod audit;
pub mod client;
pub mod clock;
pub mod config;
pub mod cookie;
pub mod daemon_lock;
pub mod paths;
pub mod pause;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod root;
pub mod server;
pub mod states;
pub mod subscription;
pub mod sync;
pub mod util;
pub mod view;
