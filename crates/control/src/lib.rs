//! Skewer - Plugin control
//!
//! The supervisor runs each service as a confined child process and talks to
//! it over its standard streams: length-delimited frames carrying
//! `command [body]` messages. This crate holds both sides of that protocol:
//!
//! - [`PluginController`]: supervisor-side lifecycle state machine
//!   (create → start → stop/shutdown → reap), fd inheritance and kill
//!   handling
//! - [`run_child`]: child-side command loop dispatching to a service
//! - [`StorePlugin`]: the store child specialisation, which accepts parsed
//!   messages from the whole daemon and streams them to its child over a
//!   dedicated pipe

mod child;
mod codec;
mod controller;
mod store;

pub use child::{
    ChildFds, ChildOutput, ChildReporter, ChildService, ChildStasher, child_fds, child_output,
    is_test_mode, run_child,
};
pub use codec::{
    ChildMessage, ControlCodec, ControlError, ParentCommand, read_frame, write_frame,
};
pub use controller::{CONF_DIR_ENV, PluginController, STORE_PATH_ENV};
pub use store::StorePlugin;

/// Environment flag: a logger descriptor is inherited
pub const HAS_LOGGER_ENV: &str = "SKEWER_HAS_LOGGER";

/// Environment flag: a message pipe descriptor is inherited
pub const HAS_PIPE_ENV: &str = "SKEWER_HAS_PIPE";

/// Environment flag: run in test mode (echo instead of producing)
pub const TEST_ENV: &str = "SKEWER_TEST";
