pub mod agent_state;
pub mod config;
pub mod ws_agent_handler;
