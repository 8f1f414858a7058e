pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod hasher;
pub mod index;
pub mod lock;
pub mod primitive;
pub mod progress;
pub mod report;
pub mod session;
pub mod verify;

pub use config::DedupeConfig;
pub use error::{Error, Result};
pub use executor::{DedupeExecutor, DedupeOutcome, FailureReason};
pub use primitive::{ByteCompareShare, ExtentShare, FideduperangeShare, PrimitiveError};
pub use progress::{ProgressReporter, SilentReporter};
pub use report::{Disposition, RangeReport, SessionReport};
pub use session::{DedupeSession, SessionHandle, SessionState};
