//! Encrypted, verifiable, resumable backup transfer between an on-site staging area and an
//! off-site SSH/rsync archive.
//!
//! The pipeline, leaf-to-root: [`crypto`] compresses and GPG-encrypts single files;
//! [`volume`] fans a volume's files through it and archives the result; [`remote`] is the
//! SSH/rsync-backed off-site filesystem; [`descriptor`] and [`validator`] keep the remote
//! layout self-describing and its content verifiable; [`upload`], [`download`], and
//! [`retention`] are the per-backup state machines that drive all of the above.

pub mod config;
pub mod context;
pub mod crypto;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod model;
pub mod process;
pub mod remote;
pub mod retention;
pub mod upload;
pub mod validator;
pub mod volume;
pub mod watchdog;

pub use context::RunContext;
pub use error::{BurError, BurResult};
pub use model::{Customer, OffsiteConfig};
pub use remote::{RemoteStore, SharedStore};
