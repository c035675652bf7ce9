pub mod adapters;
pub mod handler;
pub mod socket;
