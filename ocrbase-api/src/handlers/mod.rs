pub mod app;
pub mod jobs;
pub mod realtime;
pub mod submission;
