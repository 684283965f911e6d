pub mod core;
pub mod history;
pub mod rollback;
pub mod rules;
pub mod setup;
pub mod students;
pub mod uploads;
