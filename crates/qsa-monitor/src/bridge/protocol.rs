//! Wire protocol types for admin/worker communication.
//!
//! The channel is asymmetric:
//! - **admin → worker**: unframed command tokens, one per line, optionally
//!   followed by a correlation id (`"stats 42\n"`).
//! - **worker → admin**: length-prefixed JSON frames carrying a [`Reply`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Commands a worker answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Metadata,
    Logs,
    Stats,
}

impl Command {
    pub const ALL: [Command; 3] = [Command::Metadata, Command::Logs, Command::Stats];

    pub fn as_token(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Logs => "logs",
            Self::Stats => "stats",
        }
    }

    /// First command whose token occurs anywhere in `text`.
    pub fn find_in(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|command| text.contains(command.as_token()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_token() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// A command as written on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandToken {
    pub command: Command,
    pub correlation: Option<u64>,
}

impl CommandToken {
    /// Bare token, as sent by peers that predate correlation ids.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            correlation: None,
        }
    }

    pub fn correlated(command: Command, correlation: u64) -> Self {
        Self {
            command,
            correlation: Some(correlation),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self.correlation {
            Some(id) => format!("{} {}\n", self.command.as_token(), id).into_bytes(),
            None => format!("{}\n", self.command.as_token()).into_bytes(),
        }
    }
}

/// One line of a received command chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Known(CommandToken),
    Unknown {
        text: String,
        correlation: Option<u64>,
    },
}

impl ParsedCommand {
    pub fn correlation(&self) -> Option<u64> {
        match self {
            Self::Known(token) => token.correlation,
            Self::Unknown { correlation, .. } => *correlation,
        }
    }
}

/// Split a chunk read from the socket into commands.
///
/// Tokens are matched by substring, so a bare `stats` without a trailing
/// newline is still recognized. The correlation id, if any, is the last
/// whitespace-separated word of the line.
pub fn parse_commands(chunk: &[u8]) -> Vec<ParsedCommand> {
    String::from_utf8_lossy(chunk)
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}

/// Parse one command line, already stripped of its newline.
pub fn parse_line(line: &str) -> ParsedCommand {
    let correlation = line
        .split_whitespace()
        .skip(1)
        .last()
        .and_then(|word| word.parse().ok());

    match Command::find_in(line) {
        Some(command) => ParsedCommand::Known(CommandToken {
            command,
            correlation,
        }),
        None => ParsedCommand::Unknown {
            text: line.to_string(),
            correlation,
        },
    }
}

/// Frame payload sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id copied from the command, absent for bare tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub body: serde_json::Value,
}

impl Reply {
    pub fn new(id: Option<u64>, body: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id,
            body: serde_json::to_value(body)?,
        })
    }
}

/// Answer to `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    /// Active server extensions.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Component name to version.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    /// Data providers available to the engine.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub cache: CacheInfo,
}

/// The engine's project cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// File names (without directories) of the cached projects.
    #[serde(default)]
    pub projects: Vec<String>,
}

impl CacheInfo {
    /// Keep only the file name of each project path.
    pub fn from_project_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let projects = paths
            .into_iter()
            .map(|path| {
                let path = path.as_ref();
                path.file_name()
                    .unwrap_or(path.as_os_str())
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        Self { projects }
    }
}

/// Answer to `logs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsReport {
    pub logs: String,
}

/// Answer to `stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Requests started since the worker came up.
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Milliseconds elapsed on the in-flight request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// Answer to anything that is not a known token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownCommandReport {
    pub error: String,
    pub command: String,
}

impl UnknownCommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            error: "unknown command".to_string(),
            command: command.into(),
        }
    }
}
