pub mod face;
pub mod job;
