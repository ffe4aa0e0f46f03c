//! Interactive first-run setup and hosted-root resolution.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::DEFAULT_BASTION_URL;

/// Prompts for whichever of url/token/path the CLI did not provide.
pub fn complete(
    url: Option<String>,
    token: Option<String>,
    hosted_path: Option<String>,
) -> Result<(String, String, String)> {
    println!();
    println!("  stowaway-agent setup");
    println!();

    let url = match url.filter(|u| !u.is_empty()) {
        Some(url) => url,
        None => prompt_with_default("host", DEFAULT_BASTION_URL)?,
    };
    let hosted_path = match hosted_path.filter(|p| !p.is_empty()) {
        Some(path) => path,
        None => prompt_required("directory to serve (absolute path, e.g. ~/files)")?,
    };
    let token = match token.filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => prompt_token()?,
    };

    println!();
    println!("  connecting...");
    println!();
    Ok((url, token, hosted_path))
}

/// Expands a leading `~` to the user's home directory and absolutizes the
/// result. `~user` forms are not supported and are treated literally.
pub fn resolve_dir(path: &str) -> Result<PathBuf> {
    let expanded = if path == "~" {
        home_dir()?
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_dir()?.join(rest)
    } else {
        PathBuf::from(path)
    };
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()
            .context("cannot resolve working directory")?
            .join(expanded))
    }
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("cannot determine home directory")
}

fn prompt_with_default(label: &str, default: &str) -> Result<String> {
    print!("  {label} [{default}]: ");
    io::stdout().flush()?;
    let line = read_line()?;
    if line.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(line)
    }
}

fn prompt_required(label: &str) -> Result<String> {
    loop {
        print!("  {label}: ");
        io::stdout().flush()?;
        let line = read_line()?;
        if !line.is_empty() {
            return Ok(line);
        }
    }
}

/// Reads the token, masking input when stdin is a TTY.
fn prompt_token() -> Result<String> {
    loop {
        let line = if io::stdin().is_terminal() {
            rpassword::prompt_password("  token (from console, paste then enter): ")?
        } else {
            print!("  token (from console, paste then enter): ");
            io::stdout().flush()?;
            read_line()?
        };
        let token = line.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }
}

fn read_line() -> Result<String> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read stdin")?;
    Ok(line.trim().to_string())
}
