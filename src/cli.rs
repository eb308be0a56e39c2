//! Interactive prompt for a remote engine.
//!
//! The utilities in this module back the `tabwire-cli` binary: [`prompt`]
//! reads one line and parses it into an [`Input`], a [`Session`] runs inputs
//! against a [`StorageClient`].
//!
//! # Overview
//!
//! Meta commands start with a dot:
//!
//! - `.open <name> <key type> <record type>`: open (or create) a table and make it current.
//! - `.tables`: list every structure on the engine.
//! - `.commit`: flush and commit.
//! - `.exit`: flush and leave.
//!
//! Everything else runs against the current table: `put <key> <record>`,
//! `get <key>`, `del <key>`, `count`, `first`, `last`, `scan [from] [to]` and
//! `rscan [from] [to]`. Keys and records are parsed with the table's types.
//!
//! # Example
//! ```rust
//! use tabwire::cli::Input;
//!
//! let input: Input = "get 42".try_into().unwrap();
//! assert_eq!(input, Input::Get("42".to_string()));
//! ```
use std::{
    fmt::Write as _,
    io::{self, BufRead, Write},
};

use thiserror::Error;

use crate::{
    client::{RemoteScan, RemoteTable, StorageClient},
    data::{Data, DataType},
};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("no table is open. Example: .open people int64 string")]
    NoTable,

    #[error(transparent)]
    Client(#[from] crate::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Exit,
    Open {
        name: String,
        key_type: DataType,
        record_type: DataType,
    },
    Tables,
    Commit,
    Put { key: String, record: String },
    Get(String),
    Delete(String),
    Count,
    First,
    Last,
    Scan {
        from: Option<String>,
        to: Option<String>,
    },
    ReverseScan {
        from: Option<String>,
        to: Option<String>,
    },
    /// Blank line.
    Nothing,
}

fn invalid(command: &str, reason: impl Into<String>) -> CliError {
    CliError::InvalidArguments {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn single(command: &str, args: &[&str], example: &str) -> Result<String, CliError> {
    match args {
        [arg] => Ok(arg.to_string()),
        _ => Err(invalid(command, format!("takes one key. Example: {example}"))),
    }
}

fn bounds(command: &str, args: &[&str]) -> Result<(Option<String>, Option<String>), CliError> {
    match args {
        [] => Ok((None, None)),
        [from] => Ok((Some(from.to_string()), None)),
        [from, to] => Ok((Some(from.to_string()), Some(to.to_string()))),
        _ => Err(invalid(command, "takes at most two bounds")),
    }
}

impl TryFrom<&str> for Input {
    type Error = CliError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        let Some((command, rest)) = line
            .split_once(char::is_whitespace)
            .or(Some((line, "")))
            .filter(|(c, _)| !c.is_empty())
        else {
            return Ok(Input::Nothing);
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match command {
            ".exit" => Ok(Input::Exit),
            ".tables" => Ok(Input::Tables),
            ".commit" => Ok(Input::Commit),
            ".open" => match args[..] {
                [name, key_type, record_type] => Ok(Input::Open {
                    name: name.to_string(),
                    key_type: key_type.parse().map_err(|e| invalid(command, e))?,
                    record_type: record_type.parse().map_err(|e| invalid(command, e))?,
                }),
                _ => Err(invalid(
                    command,
                    "requires a name, a key type and a record type. Example: .open people int64 string",
                )),
            },
            "put" => match rest.trim().split_once(char::is_whitespace) {
                Some((key, record)) => Ok(Input::Put {
                    key: key.to_string(),
                    record: record.trim().to_string(),
                }),
                None => Err(invalid(command, "requires a key and a record. Example: put 1 alice")),
            },
            "get" => Ok(Input::Get(single(command, &args, "get 1")?)),
            "del" => Ok(Input::Delete(single(command, &args, "del 1")?)),
            "count" => Ok(Input::Count),
            "first" => Ok(Input::First),
            "last" => Ok(Input::Last),
            "scan" => {
                let (from, to) = bounds(command, &args)?;
                Ok(Input::Scan { from, to })
            }
            "rscan" => {
                let (from, to) = bounds(command, &args)?;
                Ok(Input::ReverseScan { from, to })
            }
            _ => Err(CliError::UnrecognizedCommand(line.to_string())),
        }
    }
}

/// Prompt user for a valid input line.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Input, CliError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Input::Exit);
    }
    s.as_str().try_into()
}

/// A client plus the table the user is working on.
pub struct Session {
    client: StorageClient,
    table: Option<RemoteTable>,
}

impl Session {
    pub fn new(client: StorageClient) -> Self {
        Self {
            client,
            table: None,
        }
    }

    fn table(&self) -> Result<&RemoteTable, CliError> {
        self.table.as_ref().ok_or(CliError::NoTable)
    }

    fn key(&self, raw: &str) -> Result<Data, CliError> {
        let table = self.table()?;
        table
            .descriptor()
            .key_type
            .parse_value(raw)
            .map_err(|e| invalid("key", e))
    }

    /// Runs one input. Returns the text to show, if any.
    pub fn execute(&mut self, input: Input) -> Result<Option<String>, CliError> {
        let output = match input {
            Input::Nothing => None,
            Input::Exit => {
                self.client.flush()?;
                None
            }
            Input::Open {
                name,
                key_type,
                record_type,
            } => {
                let table = self.client.open_table(&name, key_type, record_type)?;
                let shown = table.descriptor().to_string();
                self.table = Some(table);
                Some(format!("opened {shown}"))
            }
            Input::Tables => {
                let mut out = String::new();
                for descriptor in self.client.enumerate()? {
                    let _ = writeln!(out, "{descriptor}");
                }
                Some(out.trim_end().to_string())
            }
            Input::Commit => {
                self.client.commit()?;
                Some("committed".to_string())
            }
            Input::Put { key, record } => {
                let table = self.table()?;
                let record = table
                    .descriptor()
                    .record_type
                    .parse_value(&record)
                    .map_err(|e| invalid("put", e))?;
                table.replace(self.key(&key)?, record)?;
                None
            }
            Input::Get(key) => Some(match self.table()?.try_get(self.key(&key)?)? {
                Some(record) => record.to_string(),
                None => format!("key {key} not found"),
            }),
            Input::Delete(key) => {
                self.table()?.delete(self.key(&key)?)?;
                None
            }
            Input::Count => Some(self.table()?.count()?.to_string()),
            Input::First => Some(show_row(self.table()?.first_row()?)),
            Input::Last => Some(show_row(self.table()?.last_row()?)),
            Input::Scan { from, to } => {
                let (from, to) = self.bounds(from, to)?;
                Some(show_scan(self.table()?.forward(from, to)?)?)
            }
            Input::ReverseScan { from, to } => {
                let (from, to) = self.bounds(from, to)?;
                Some(show_scan(self.table()?.backward(from, to)?)?)
            }
        };
        Ok(output)
    }

    fn bounds(
        &self,
        from: Option<String>,
        to: Option<String>,
    ) -> Result<(Option<Data>, Option<Data>), CliError> {
        let from = from.map(|k| self.key(&k)).transpose()?;
        let to = to.map(|k| self.key(&k)).transpose()?;
        Ok((from, to))
    }

    /// Flushes every open table and drops the connection.
    pub fn close(self) -> Result<(), CliError> {
        Ok(self.client.close()?)
    }
}

fn show_row(row: Option<(Data, Data)>) -> String {
    match row {
        Some((key, record)) => format!("{key} -> {record}"),
        None => "(empty)".to_string(),
    }
}

fn show_scan(scan: RemoteScan) -> Result<String, CliError> {
    let mut out = String::new();
    let mut rows = 0;
    for row in scan {
        let (key, record) = row?;
        let _ = writeln!(out, "{key} -> {record}");
        rows += 1;
    }
    let _ = write!(out, "({rows} rows)");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::tests::client, config::ClientConfig};

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_blank_lines() {
        let input = b"\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Input::Nothing, res);
    }

    #[test]
    fn end_of_input_exits() {
        let res = prompt(&b""[..], Vec::new()).unwrap();
        assert_eq!(Input::Exit, res);
    }

    #[test]
    #[should_panic(expected = "unrecognized command '.something_wrong'")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }

    #[test]
    fn parses_arguments() {
        let parse = |s: &str| Input::try_from(s).unwrap();
        assert_eq!(
            parse(".open people int64 string"),
            Input::Open {
                name: "people".to_string(),
                key_type: DataType::Int64,
                record_type: DataType::String,
            }
        );
        assert_eq!(
            parse("put 1 alice smith"),
            Input::Put {
                key: "1".to_string(),
                record: "alice smith".to_string(),
            }
        );
        assert_eq!(
            parse("scan 3"),
            Input::Scan {
                from: Some("3".to_string()),
                to: None,
            }
        );
        assert_eq!(
            parse("rscan 9 2"),
            Input::ReverseScan {
                from: Some("9".to_string()),
                to: Some("2".to_string()),
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(
            Input::try_from(".open people int64"),
            Err(CliError::InvalidArguments { .. })
        ));
        assert!(matches!(
            Input::try_from(".open people int64 nope"),
            Err(CliError::InvalidArguments { .. })
        ));
        assert!(matches!(Input::try_from("put 1"), Err(CliError::InvalidArguments { .. })));
        assert!(matches!(Input::try_from("get"), Err(CliError::InvalidArguments { .. })));
        assert!(matches!(
            Input::try_from("scan 1 2 3"),
            Err(CliError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn session_runs_against_a_table() {
        let (client, _) = client(ClientConfig::default().with_page_size(2));
        let mut session = Session::new(client);
        let mut run = |line: &str| session.execute(Input::try_from(line).unwrap());

        assert!(matches!(run("count"), Err(CliError::NoTable)));
        run(".open people int64 string").unwrap();
        run("put 2 bob").unwrap();
        run("put 1 alice smith").unwrap();
        run("put 3 carol").unwrap();
        run("del 3").unwrap();

        assert_eq!(run("get 1").unwrap().unwrap(), "\"alice smith\"");
        assert_eq!(run("get 3").unwrap().unwrap(), "key 3 not found");
        assert_eq!(run("count").unwrap().unwrap(), "2");
        assert_eq!(run("first").unwrap().unwrap(), "1 -> \"alice smith\"");
        assert_eq!(
            run("rscan").unwrap().unwrap(),
            "2 -> \"bob\"\n1 -> \"alice smith\"\n(2 rows)"
        );
        assert!(matches!(run("get one"), Err(CliError::InvalidArguments { .. })));
        assert_eq!(run(".commit").unwrap().unwrap(), "committed");
        assert!(run(".tables").unwrap().unwrap().contains("people"));
    }
}
