//! Cross-task coordination: shutdown signalling

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownPhase, ShutdownSignal, ShutdownToken,
};
