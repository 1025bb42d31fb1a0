pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod notifications;
pub mod reports;
pub mod schools;
pub mod session;
pub mod setup;
pub mod students;
pub mod teachers;
