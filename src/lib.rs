//! Runtime for AppBundle executables.
//!
//! An AppBundle is this runtime's ELF binary with a trailer appended: a
//! Base64 zstd tar of FUSE helper tools, a few metadata lines, and a squashfs
//! or dwarfs image. At launch the runtime finds the trailer in its own file,
//! mounts (or extracts) the image into a private work directory, composes the
//! environment, runs the bundled `AppRun`, and reclaims the work directory.
//!
//! # Architecture
//!
//! ```text
//! bin/appbundle-runtime
//!     │
//!     ├── trailer      locate markers and metadata after the ELF segments
//!     ├── config       RuntimeConfig built once from trailer + environment
//!     ├── session      dispatch, exit status, cleanup on every path
//!     ├── dispatch     reserved --pbundle_* flags, or launch the entrypoint
//!     │     ├── tools        resolve or unpack FUSE helpers
//!     │     ├── activate     mount / extract with fallback policy
//!     │     └── environment  child PATH, scoped variables, portable dirs
//!     └── lifecycle    fire-once detached cleanup, signal handling
//!           └── reclaim  unmount retries and directory removal
//! ```
//!
//! External helpers run through [`process::Runner`] and mount checks go
//! through [`lifecycle::MountProbe`], so every component can be exercised
//! without FUSE.

pub mod activate;
pub mod config;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod filesystem;
pub mod lifecycle;
pub mod logging;
pub mod process;
pub mod session;
pub mod tools;
pub mod trailer;

pub use config::{RunBehavior, RuntimeConfig};
pub use dispatch::{dispatch, Launch, Outcome, Services};
pub use error::BundleError;
pub use filesystem::FsKind;
pub use trailer::Trailer;
