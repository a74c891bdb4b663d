use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tradutor", version, about = "Asynchronous translation service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Serve the translation HTTP API.
    Api,
    /// Consume queued translation jobs.
    Worker,
    /// Submit text to a running API and wait for the translation.
    Translate(TranslateArgs),
}

#[derive(Debug, PartialEq, Eq, Parser)]
pub struct TranslateArgs {
    pub text: String,
    #[arg(short = 'f', long = "from", default_value = "en")]
    pub source_language: String,
    #[arg(short = 't', long = "to", default_value = "pt")]
    pub target_language: String,
    /// Overrides `API_URL`.
    #[arg(long = "api-url")]
    pub api_url: Option<String>,
}
