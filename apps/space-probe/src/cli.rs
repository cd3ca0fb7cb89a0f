use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "space-probe",
    about = "Resolve a hosted space, report its runtime and optionally run one job",
    author,
    version
)]
pub struct Cli {
    #[arg(value_name = "SPACE", help = "owner/name reference or full space URL")]
    pub space: String,

    #[arg(
        long,
        env = "HF_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Access token for private spaces"
    )]
    pub token: Option<String>,

    #[arg(
        long,
        value_name = "SECS",
        help = "Seconds to wait for the space to start",
        long_help = "How long to wait for the space to start. \
                     Defaults to SPACE_CLIENT__RUNTIME_TIMEOUT_SECS."
    )]
    pub timeout: Option<u64>,

    #[arg(long, help = "Validate the token against the identity endpoint first")]
    pub whoami: bool,

    #[arg(long, help = "Use a space-scoped token for requests to the space")]
    pub exchange_token: bool,

    #[arg(long, value_name = "FILE", num_args = 1.., help = "Upload files before submitting")]
    pub upload: Vec<PathBuf>,

    #[arg(long, value_name = "NAME", conflicts_with = "fn_index", help = "Named endpoint to call")]
    pub endpoint: Option<String>,

    #[arg(long, value_name = "INDEX", help = "Dependency index to call")]
    pub fn_index: Option<u64>,

    #[arg(
        long,
        value_name = "JSON",
        default_value = "[]",
        help = "Input payload; a non-array value is sent as a single input"
    )]
    pub data: String,

    #[arg(long, help = "Print the runtime stage, wake the space if paused, and exit")]
    pub wake_only: bool,
}
