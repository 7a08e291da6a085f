//! Long-lived tasks that keep the system running: signal handling and
//! the pump that folds cached log output into the control message log.
//! These tasks should *ALWAYS* quit when quit is broadcast, or the
//! system may never die.

pub mod daemon;
pub mod message_log;
