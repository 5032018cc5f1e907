pub mod attendance;
pub mod backup;
pub mod core;
pub mod grid;
pub mod import;
pub mod ledger;
pub mod students;
pub mod terms;
