use std::path::PathBuf;
use thiserror::Error;

use crate::migration::SaveLocation;
use crate::token::TokenError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Package archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Malformed protocol response: {0}")]
    Xml(String),

    #[error("Transfer failed: {0}\n\n\
             Hint: Check your network connection and try again.")]
    Transport(String),

    #[error("Unable to fetch download URL for version '{identifier}'.{}", beta_hint(.beta))]
    UnresolvableIdentifier { identifier: String, beta: bool },

    #[error("Failed to authenticate: {0}")]
    Authentication(#[from] TokenError),

    #[error("Deployment failed: {0}")]
    Deployment(String),

    #[error("Staging the package failed: {0}\n\n\
             Hint: The package file may be corrupt. Decryption keys are provisioned by the \
             store, so the same title must have been installed from the official store on \
             this account at least once.")]
    StagingFailed(String),

    #[error("Helper process '{program}' failed (exit code {code:?})\n{stdout}\n{stderr}\n\n\
             Hint: The helper runs inside the installed package. Make sure the title was \
             installed from the official store on this account.")]
    Helper {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Timed out after {0} seconds waiting for the decrypted executable\n\n\
             Hint: The helper process did not produce the executable. Make sure the title \
             was installed from the official store on this account.")]
    HelperTimeout(u64),

    #[error("The temporary backup directory already exists: {}\n\n\
             Hint: A previous backup of your saved data was never restored. \
             Copy this directory somewhere safe and delete it, then try again.",
             .0.display())]
    BackupConflict(PathBuf),

    #[error("Saved data was found in more than one location:\n{}\n\n\
             Hint: Merge or move the worlds by hand so only one location contains them, \
             then try again.",
             format_candidates(.0))]
    SaveDataConflict(Vec<SaveLocation>),

    #[error("Found {0} staged locations for package family '{1}'\n\n\
             Hint: Another Windows user account probably has this title installed. \
             Remove it there and try again.")]
    MultipleStagedLocations(usize, String),

    #[error("No staged location was found for package family '{0}'")]
    NoStagedLocation(String),

    #[error("Another container install is already in progress. Wait for it to finish and try again.")]
    StagingInProgress,

    #[error("Another version is already being launched.")]
    LaunchInProgress,

    #[error("Version '{0}' is currently being modified. Please wait a few moments and try again.")]
    Busy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("The import destination already exists: {}\n\n\
             Hint: To avoid loss of data, importing was aborted. Remove the directory manually \
             (or remove the imported version) and try again.",
             .0.display())]
    ImportTargetExists(PathBuf),

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

fn beta_hint(beta: &bool) -> &'static str {
    if *beta {
        "\n\nHint: For beta versions, make sure your account is subscribed to the beta \
         programme in the Xbox Insider Hub app."
    } else {
        ""
    }
}

fn format_candidates(candidates: &[SaveLocation]) -> String {
    candidates
        .iter()
        .map(|c| format!("  - {} ({} worlds)", c.path.display(), c.worlds))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// Cancellation is not a failure and is never surfaced to the operator.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Errors that need a human to move or merge data before any retry.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Error::BackupConflict(_)
                | Error::SaveDataConflict(_)
                | Error::MultipleStagedLocations(..)
        )
    }

    /// Transport failures can be retried as-is by re-running the command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Transport(_))
    }
}
