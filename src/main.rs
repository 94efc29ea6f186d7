mod chat;
mod client;
mod config;
mod context;
mod logging;
mod session;
mod stream;
mod suggestion;
mod transcript;
mod tui;

use anyhow::{Result, bail};
use clap::{CommandFactory, Parser};
use config::{ConfigFile, Overrides, ResolvedConfig};
use std::io::Write;
use tokio::sync::mpsc;

use chat::ChatContext;
use session::SessionState;

#[derive(Parser, Debug)]
#[command(
    name = "oxchat",
    version,
    about = "Chat with a local model server and apply the code changes it suggests",
    long_about = None,
)]
struct Args {
    /// Prompt to send directly (omit to enter interactive TUI mode)
    prompt: Option<String>,

    /// Profile to use from config file
    #[arg(short, long, env = "OXCHAT_PROFILE")]
    profile: Option<String>,

    /// Override endpoint URL
    #[arg(long, env = "OXCHAT_ENDPOINT")]
    endpoint: Option<String>,

    /// Override model name
    #[arg(short, long, env = "OXCHAT_MODEL")]
    model: Option<String>,

    /// Override API key
    #[arg(long, env = "OXCHAT_API_KEY")]
    api_key: Option<String>,

    /// Attach a file to the conversation context (repeatable)
    #[arg(short, long = "context", value_name = "PATH")]
    context: Vec<String>,

    /// Fetch the whole reply in one request instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Single-shot mode: apply the suggested change without asking
    #[arg(long)]
    apply: bool,

    /// Write a default config file to ~/.config/oxchat/config.toml and exit
    #[arg(long)]
    init: bool,

    /// List available profiles and exit
    #[arg(long)]
    profiles: bool,

    /// Generate shell completions and print to stdout (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL")]
    completions: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── --init ────────────────────────────────────────────────────────────────
    if args.init {
        let path = ConfigFile::write_default_if_missing()?;
        println!("Config written to: {}", path.display());
        println!("Edit it, then run: oxchat");
        return Ok(());
    }

    // ── --completions ─────────────────────────────────────────────────────────
    if let Some(shell_name) = &args.completions {
        return generate_completions(shell_name);
    }

    let file = ConfigFile::load()?;

    // ── --profiles ────────────────────────────────────────────────────────────
    if args.profiles {
        print_profiles(&file);
        return Ok(());
    }

    let resolved = ResolvedConfig::resolve(
        &file,
        &Overrides {
            profile: args.profile.as_deref(),
            endpoint: args.endpoint.as_deref(),
            model: args.model.as_deref(),
            api_key: args.api_key.as_deref(),
            no_stream: args.no_stream,
        },
    );

    let log_path = resolved.log_path();
    let _log_guard = match logging::init(&log_path) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("  logging disabled: {e:#}");
            None
        }
    };

    // ── Single-shot mode (non-TUI) ────────────────────────────────────────────
    if let Some(prompt) = args.prompt {
        return run_single_shot(prompt, resolved, &args.context, args.apply).await;
    }

    // ── Interactive TUI mode ──────────────────────────────────────────────────
    tui::run(resolved, args.context).await
}

// ── Single-shot mode (plain stdout, no TUI) ───────────────────────────────────

async fn run_single_shot(prompt: String, resolved: ResolvedConfig, context: &[String], apply: bool) -> Result<()> {
    println!();
    println!("  ▲ oxchat  {}  ·  {}", resolved.profile_name, resolved.model);
    println!();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut chat = ChatContext::new(&resolved, tx)?;
    let root = chat.workspace().root().to_path_buf();
    for path in context {
        chat.bundle_mut().add_file(&root, path)?;
        println!("  + {path}");
    }

    chat.transcript_mut().set_input(&prompt);
    chat.send()?;

    let mut printed = 0usize;
    let mut stdout = std::io::stdout();
    while chat.is_busy() {
        let Some(msg) = rx.recv().await else { break };
        chat.handle_net(msg);
        if let Some(session) = chat.session() {
            let text = session.text();
            if text.len() > printed {
                print!("{}", &text[printed..]);
                stdout.flush()?;
                printed = text.len();
            }
        }
    }
    println!();

    if let Some(SessionState::Failed(e)) = chat.session_state() {
        bail!("{e}");
    }

    let Some(pending) = chat.pending() else {
        return Ok(());
    };
    println!();
    for line in pending.preview() {
        println!("  {line}");
    }
    println!();
    if apply {
        let applied = chat.accept_suggestion()?;
        println!("  ✓ applied to {}:{}", applied.target, applied.line);
    } else {
        println!("  suggestion not applied (re-run with --apply)");
    }
    Ok(())
}

// ── Profiles listing (non-TUI) ────────────────────────────────────────────────

fn print_profiles(file: &ConfigFile) {
    let mut entries: Vec<(&String, &config::Profile)> = file.profiles.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    println!();
    println!("  Profiles");
    for (name, profile) in entries {
        let marker = if *name == file.default_profile { " ←" } else { "" };
        println!("  {name}{marker}");
        println!("    endpoint  {}", profile.endpoint);
        println!("    model     {}", profile.model);
        println!("    stream    {}", if profile.stream { "on" } else { "off" });
        println!();
    }
}

// ── Shell completions ─────────────────────────────────────────────────────────

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{Shell, generate};

    let shell: Shell = match shell_name.to_lowercase().as_str() {
        "bash"    => Shell::Bash,
        "zsh"     => Shell::Zsh,
        "fish"    => Shell::Fish,
        "elvish"  => Shell::Elvish,
        _ => bail!("Unknown shell: {shell_name} (supported: bash, zsh, fish, elvish)"),
    };

    let mut cmd = Args::command();
    generate(shell, &mut cmd, "oxchat", &mut std::io::stdout());
    Ok(())
}
