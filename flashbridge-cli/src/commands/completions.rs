//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::Cli;

/// Render the completion script for `shell`.
fn render(shell: Shell) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut buf);
    buf
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let _ = std::io::stdout().write_all(&render(shell));
}

/// Map a shell binary path (e.g. `$SHELL`) to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    match Path::new(shell_path).file_name()?.to_str()? {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        _ => None,
    }
}

/// Where the completion script for `shell` is installed.
fn install_path(shell: Shell) -> Result<PathBuf> {
    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = match shell {
        Shell::Bash => dirs
            .data_local_dir()
            .join("bash-completion/completions/flashbridge"),
        Shell::Zsh => dirs.home_dir().join(".zfunc/_flashbridge"),
        Shell::Fish => dirs.config_dir().join("fish/completions/flashbridge.fish"),
        other => anyhow::bail!(
            "Auto-install supports bash, zsh and fish; redirect `flashbridge completions {other}` to your {other} profile instead"
        ),
    };
    Ok(path)
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => env::var("SHELL")
            .ok()
            .as_deref()
            .and_then(shell_from_path)
            .context(
                "Could not detect your shell. Please specify it explicitly:\n  \
                 flashbridge completions --install bash",
            )?,
    };

    let path = install_path(shell)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, render(shell))
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {shell} completions to {}",
        style("✓").green().bold(),
        style(path.display()).yellow()
    );
    match shell {
        Shell::Bash => eprintln!(
            "To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => eprintln!(
            "Add {} to ~/.zshrc if it is not there yet",
            style("fpath=(~/.zfunc $fpath); autoload -Uz compinit && compinit").cyan()
        ),
        _ => {},
    }
    Ok(())
}
