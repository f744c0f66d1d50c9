#![forbid(unsafe_code)]
//! A thin command-line front end over `ledgerdb-catalog`, for manually
//! walking through a page's lifecycle from a shell. Every invocation is
//! its own process: there is no daemon, so explicit transactions (which
//! need an in-memory `PageHandle` held across calls) aren't exposed
//! here — each command performs one implicit, self-contained operation.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ledgerdb_catalog::{Repository, RepositoryOptions};
use ledgerdb_objects::ObjectType;
use ledgerdb_types::{KeyPriority, LedgerName, PageId, PAGE_ID_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("storage error: {0}")]
    Storage(#[from] ledgerdb_types::Status),
    #[error("invalid page id {0:?}: expected {expected} hex characters", expected = PAGE_ID_SIZE * 2)]
    InvalidPageId(String),
    #[error("key not found")]
    KeyNotFound,
}

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "ledgerdb", about = "Inspect and mutate a ledgerdb repository on disk")]
pub struct Cli {
    /// Root content directory for the repository.
    #[arg(long, global = true, default_value = "./ledgerdb-data")]
    pub repo: PathBuf,

    /// The ledger to operate on.
    #[arg(long, global = true)]
    pub ledger: String,

    /// The page within that ledger, as 32 hex characters.
    #[arg(long, global = true)]
    pub page: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Priority {
    Eager,
    Lazy,
}

impl From<Priority> for KeyPriority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Eager => KeyPriority::Eager,
            Priority::Lazy => KeyPriority::Lazy,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Writes one key, committing immediately.
    Put {
        key: String,
        value: String,
        #[arg(long, value_enum, default_value = "eager")]
        priority: Priority,
    },
    /// Reads one key's current value.
    Get { key: String },
    /// Deletes one key, committing immediately.
    Delete { key: String },
    /// Lists the page's current head commit ids.
    Heads,
    /// Runs one LRU eviction sweep over the whole repository.
    Cleanup {
        #[arg(long, default_value_t = 16)]
        max_candidates: usize,
    },
}

fn parse_page_id(s: &str) -> Result<PageId> {
    if s.len() != PAGE_ID_SIZE * 2 {
        return Err(CliError::InvalidPageId(s.to_string()));
    }
    let mut bytes = [0u8; PAGE_ID_SIZE];
    for (i, byte) in bytes.iter_mut().enumerate() {
        let hi = s.get(i * 2..i * 2 + 1).and_then(|c| u8::from_str_radix(c, 16).ok());
        let lo = s.get(i * 2 + 1..i * 2 + 2).and_then(|c| u8::from_str_radix(c, 16).ok());
        match (hi, lo) {
            (Some(hi), Some(lo)) => *byte = (hi << 4) | lo,
            _ => return Err(CliError::InvalidPageId(s.to_string())),
        }
    }
    Ok(PageId::new(bytes))
}

/// Runs the parsed command, printing its result to stdout.
pub fn run(cli: Cli) -> Result<()> {
    let repo = Repository::open(cli.repo, RepositoryOptions::default())?;
    let ledger = repo.get_ledger(LedgerName::new(cli.ledger.into_bytes()))?;
    let page_id = parse_page_id(&cli.page)?;
    let page = ledger.get_page(page_id)?;

    match cli.command {
        Command::Put { key, value, priority } => {
            let object_id = page.storage().add_object_from_local(value.as_bytes(), ObjectType::Blob)?;
            let commit = page.put_implicit(key.into_bytes(), object_id, priority.into())?;
            println!("committed {}", commit.id);
        }
        Command::Get { key } => {
            let heads = page.storage().get_head_commits()?;
            let Some(head_id) = heads.first() else {
                return Err(CliError::KeyNotFound);
            };
            let head = page.storage().get_commit(head_id)?;
            let entry = page
                .storage()
                .get_entry_from_commit(&head, key.as_bytes())?
                .ok_or(CliError::KeyNotFound)?;
            let value = page.storage().get_object(&entry.object_identifier)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Delete { key } => {
            let commit = page.delete_implicit(key.into_bytes())?;
            println!("committed {}", commit.id);
        }
        Command::Heads => {
            for head in page.storage().get_head_commits()? {
                println!("{head}");
            }
        }
        Command::Cleanup { max_candidates } => {
            let report = repo.disk_clean_up(max_candidates)?;
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_page_id() {
        let id = parse_page_id("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(id.as_bytes()[0], 0x00);
        assert_eq!(id.as_bytes()[1], 0x11);
        assert_eq!(id.as_bytes()[15], 0xff);
    }

    #[test]
    fn rejects_the_wrong_length() {
        assert!(matches!(parse_page_id("abcd"), Err(CliError::InvalidPageId(_))));
    }
}
