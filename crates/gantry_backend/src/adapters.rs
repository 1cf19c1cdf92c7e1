pub mod codex;
pub mod line_cli;

pub use codex::CodexAdapter;
pub use line_cli::CliAdapter;
