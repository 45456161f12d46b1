pub mod detection;
pub mod feedback;
pub mod job;
