//! Leaf types of the task execution core: identifiers, the status state
//! machine, cron expressions, the params envelope, the volatile state bag,
//! and the callback contract.

pub mod callback;
pub mod cron;
pub mod params;
pub mod state;
pub mod status;
pub mod types;
