//! Content rendering pipeline: choose the part of a message to show, strip
//! control characters from it, run it through a type-specific filter process
//! and hand the result, headers first, to an interactive pager.

pub mod error;
pub mod launcher;
pub mod sanitize;
pub mod selector;
pub mod session;
pub mod subprocess;

pub use {
    error::{Error, Result},
    launcher::{LaunchOutcome, ViewerLauncher},
    session::{DisplaySurface, Geometry, Session},
    subprocess::{
        Capture, Completion, ProcessHandle, ProcessId, ProcessSet, Spawner, Started, Subprocess,
        TokioSpawner,
    },
};
