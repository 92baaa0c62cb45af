pub mod cleanup;
pub mod health;
pub mod job;
pub mod stats;
