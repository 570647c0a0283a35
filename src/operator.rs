//! The person driving the launcher
//!
//! Entry points report one consolidated message per failure and ask for
//! confirmation before destroying data while restoring a backup.

use tracing::{info, warn};

pub trait Operator: Send + Sync {
    /// Show an informational or error message
    fn notify(&self, title: &str, message: &str);

    /// Ask a yes/no question; `false` means leave things as they are
    fn confirm(&self, title: &str, question: &str) -> bool;
}

/// Logs notifications and declines every confirmation
#[derive(Debug, Default, Clone)]
pub struct UnattendedOperator;

impl Operator for UnattendedOperator {
    fn notify(&self, title: &str, message: &str) {
        info!("{}: {}", title, message);
    }

    fn confirm(&self, title: &str, question: &str) -> bool {
        warn!("{}: declining unattended confirmation: {}", title, question);
        false
    }
}
