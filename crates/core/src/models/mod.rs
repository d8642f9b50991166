pub mod assignment;
pub mod common;
pub mod course;
pub mod dashboard;
pub mod event;
pub mod grade;
pub mod message;
pub mod student;
pub mod sync;
pub mod token;
