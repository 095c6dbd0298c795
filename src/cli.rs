//! Command line interface.

use std::path::PathBuf;

use argh::FromArgs;

/// Maintain demonstration certificates in valid, revoked and expired
/// states and serve them over HTTPS.
#[derive(Clone, Debug, FromArgs)]
pub struct Args {
    /// path to the JSON config file
    #[argh(option, default = "PathBuf::from(\"config.json\")")]
    pub config: PathBuf,
}
