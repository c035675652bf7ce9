pub mod chat_log;
pub mod rendezvous;
pub mod roster;
pub mod state_dir;
pub mod store;
pub mod transport;
