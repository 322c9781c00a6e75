pub mod chunked;
pub mod client;
pub mod config;
pub mod expiry;
pub mod health;
pub mod lock;
pub mod meta;
pub mod node;
pub mod placement;
pub mod postprocess;
pub mod queue;
pub mod record;
pub mod registry;
pub mod replication;
pub mod retry;
pub mod routes;
pub mod selector;
pub mod state;
