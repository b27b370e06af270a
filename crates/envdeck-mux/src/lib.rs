//! Session multiplexing engine for envdeck.
//!
//! One tmux instance per run hosts every session. The main window is split
//! into a control region and a single viewport; sessions are swapped into the
//! viewport on demand and keep running while parked.

pub mod error;
pub mod label;
pub mod pane;
pub mod registry;
pub mod runner;
pub mod server;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use error::MuxError;
pub use label::{next_label, TabLabel};
pub use pane::{PaneLayout, DEFAULT_LEFT_PCT};
pub use registry::{SessionRegistry, TabInfo, LOG_VIEW_PREFIX};
pub use runner::{args, ControlClient, MuxRunner, TmuxRunner};
pub use server::{
    cleanup_stale, default_marker_dir, pid_alive, socket_name_for, state_dir, MuxServer,
    SESSION_NAME,
};
pub use session::{Session, SpawnSpec, EXIT_UNKNOWN, UNTRACKED_ID};
