//! Built-in task callbacks.
//!
//! Remote concerns sit behind narrow traits ([`backup::BackupService`],
//! [`refresh::SiteInfoSource`]) so the callbacks stay testable and the wire
//! format of any particular CMS integration stays out of this crate.

pub mod backup;
pub mod logrotate;
pub mod refresh;

pub use backup::{BackupCallback, BackupParams, BackupProgress, BackupService};
pub use logrotate::{LogRotateCallback, LogRotateParams};
pub use refresh::{RefreshCallback, RefreshParams, SiteInfoSource};
