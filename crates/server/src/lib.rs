pub mod coordinator;
pub mod db;
pub mod engine;
pub mod health;
pub mod hosts;
pub mod logs;
pub mod notifications;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod stream;
pub mod tasks;
pub mod transport;
pub mod vault;
pub mod version;
pub mod web;
