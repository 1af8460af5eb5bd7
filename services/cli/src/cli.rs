use crate::config::Overrides;
use clap::Parser;
use std::path::PathBuf;
use unichat_core::protocol::Language;

#[derive(Parser, Debug)]
#[command(name = "unichat")]
#[command(version, about = "Chat with the university assistant from your terminal")]
pub struct Cli {
    /// Chat backend base URL (overrides BACKEND_URL)
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Answer language: vi or en (overrides CHAT_LANGUAGE)
    #[arg(long, value_parser = parse_language)]
    pub language: Option<Language>,

    /// Delay between revealed characters in milliseconds (overrides TYPEWRITER_SPEED_MS)
    #[arg(long)]
    pub speed_ms: Option<u64>,

    /// Ask a single question, print the answer and exit
    #[arg(long, value_name = "QUERY")]
    pub once: Option<String>,

    /// Image to attach to the --once question
    #[arg(long, value_name = "PATH", requires = "once")]
    pub image: Vec<PathBuf>,
}

fn parse_language(value: &str) -> Result<Language, String> {
    value.parse()
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            backend_url: self.backend_url.clone(),
            language: self.language,
            speed_ms: self.speed_ms,
        }
    }
}
