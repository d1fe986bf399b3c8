//! Line-oriented client commands.
//!
//! The `netconf_cli` binary reads one command per line, turns it into a
//! [`Request`] and prints the reply.
//!
//! # Grammar
//!
//! ```text
//! get [xpath]
//! get-config <datastore> [xpath]
//! edit <datastore> <xml>
//! copy <source> <target>
//! delete <datastore>
//! lock <datastore>
//! unlock <datastore>
//! commit
//! discard
//! validate <datastore>
//! kill <session-id>
//! exit
//! ```
//!
//! # Example
//! ```rust
//! use netconfd::{cli::Command, protocol::Request, storage::DatastoreId};
//!
//! let cmd: Command = "lock candidate".try_into().unwrap();
//! assert_eq!(cmd, Command::Request(Request::Lock { target: DatastoreId::Candidate }));
//! ```
use std::io::{BufRead, Write};

use thiserror::Error;

use crate::{
    protocol::Request,
    storage::{ConfigSource, DatastoreId, edit::DefaultOperation, edit::ErrorOption, filter::Filter},
    tree::Node,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("terminal error: {0}")]
    Io(String),
}

/// A user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Close the session and leave.
    Exit,
    Request(Request),
}

fn invalid(command: &str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn datastore(command: &str, arg: Option<&str>) -> Result<DatastoreId, CommandError> {
    let arg = arg.ok_or_else(|| {
        invalid(command, "requires a datastore (running, candidate or startup)")
    })?;
    arg.parse().map_err(|_| invalid(command, format!("'{arg}' is not a datastore")))
}

fn xpath(arg: Option<&str>) -> Option<Filter> {
    arg.map(|select| Filter::XPath(select.to_string()))
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let mut args = rest.split_whitespace();

        let request = match word {
            "" => return Err(CommandError::Empty),
            "exit" => return Ok(Command::Exit),
            "get" => Request::Get {
                filter: xpath(args.next()),
            },
            "get-config" => Request::GetConfig {
                source: datastore(word, args.next())?,
                filter: xpath(args.next()),
            },
            "edit" => {
                let target = datastore(word, args.next())?;
                let xml = rest
                    .split_once(char::is_whitespace)
                    .map(|(_, xml)| xml.trim())
                    .filter(|xml| !xml.is_empty())
                    .ok_or_else(|| invalid(word, "requires an xml document. Example: edit candidate <interfaces .../>"))?;
                let node = Node::parse(xml).map_err(|e| invalid(word, e.to_string()))?;
                let config = if node.name == "config" {
                    node
                } else {
                    Node::new("config").with_child(node)
                };
                Request::EditConfig {
                    target,
                    default_operation: DefaultOperation::default(),
                    error_option: ErrorOption::default(),
                    config,
                }
            }
            "copy" => Request::CopyConfig {
                source: ConfigSource::Datastore(datastore(word, args.next())?),
                target: datastore(word, args.next())?,
            },
            "delete" => Request::DeleteConfig {
                target: datastore(word, args.next())?,
            },
            "lock" => Request::Lock {
                target: datastore(word, args.next())?,
            },
            "unlock" => Request::Unlock {
                target: datastore(word, args.next())?,
            },
            "commit" => Request::Commit,
            "discard" => Request::DiscardChanges,
            "validate" => Request::Validate {
                source: ConfigSource::Datastore(datastore(word, args.next())?),
            },
            "kill" => {
                let id = args
                    .next()
                    .and_then(|id| id.parse::<u32>().ok())
                    .filter(|id| *id > 0)
                    .ok_or_else(|| invalid(word, "requires a positive session id. Example: kill 2"))?;
                Request::KillSession { session_id: id }
            }
            other => return Err(CommandError::UnrecognizedCommand(other.to_string())),
        };
        Ok(Command::Request(request))
    }
}

/// Prompt for and parse one command. End of input reads as `exit`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| CommandError::Io(e.to_string()))?;
    writer.flush().map_err(|e| CommandError::Io(e.to_string()))?;

    let n = reader
        .read_line(&mut s)
        .map_err(|e| CommandError::Io(e.to_string()))?;
    if n == 0 {
        return Ok(Command::Exit);
    }
    Command::try_from(s.as_str())
}
