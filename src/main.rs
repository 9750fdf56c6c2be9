use anyhow::Context;
use clap::{Parser, Subcommand};
use streamchat::config::{self, Config};

#[derive(Parser, Debug)]
#[command(name = "streamchat", version, about = "Streaming LLM chat with stored history")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve,
    /// Chat in the terminal.
    Chat {
        /// User the conversation belongs to.
        #[arg(long, default_value = "local")]
        user: String,
        /// Resume a stored conversation by id.
        #[arg(long)]
        resume: Option<String>,
    },
    /// Store the API key (read from stdin) in the OS keyring.
    SetKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Serve => streamchat::serve(config).await,
        Command::Chat { user, resume } => {
            let store = streamchat::open_store(&config.database_url).await?;
            streamchat::terminal::chat_repl(config, store, user, resume).await
        }
        Command::SetKey => {
            let mut key = String::new();
            std::io::stdin()
                .read_line(&mut key)
                .context("Failed to read API key from stdin")?;
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("No API key given on stdin");
            }
            config::set_api_key_in_keyring(key)?;
            println!("API key stored. Set STREAMCHAT_API_KEY_REF=keyring to use it.");
            Ok(())
        }
    }
}
