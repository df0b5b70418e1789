//! Console bridge: a blocking stdin thread feeding parsed commands to the
//! reactor through one bounded channel, each tag paired with its arguments
//! in a single queued value.

use std::io::BufRead;

use tokio::sync::mpsc;
use trellis_core::node::StartArgs;

/// One operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(StartArgs),
    Disconnect,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid command {0:?}")]
    Unknown(String),
    #[error("usage: START <artifactLocator> <checkerName> <rangeStart> <rangeEnd> <outputFilename>")]
    StartArity,
    #[error("range bound is not a number: {0:?}")]
    BadNumber(String),
    #[error("range start exceeds range end")]
    BadRange,
}

/// Parse one input line. `None` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<Command>, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Ok(None),
        ["DISCONNECT"] => Ok(Some(Command::Disconnect)),
        ["START", rest @ ..] => {
            let [locator, checker, start, end, filename] = rest else {
                return Err(ParseError::StartArity);
            };
            let start = parse_bound(start)?;
            let end = parse_bound(end)?;
            if start > end {
                return Err(ParseError::BadRange);
            }
            Ok(Some(Command::Start(StartArgs {
                locator: (*locator).to_owned(),
                checker: (*checker).to_owned(),
                start,
                end,
                filename: (*filename).to_owned(),
            })))
        }
        _ => Err(ParseError::Unknown(line.trim().to_owned())),
    }
}

fn parse_bound(token: &str) -> Result<u32, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::BadNumber(token.to_owned()))
}

/// Spawn the stdin reader thread. Parsed commands flow through the returned
/// channel; parse failures are reported to the operator and dropped. The
/// thread exits on stdin EOF or once the reactor is gone.
pub fn spawn(capacity: usize) -> mpsc::Receiver<Command> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_line(&line) {
                Ok(Some(cmd)) => {
                    if tx.blocking_send(cmd).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => eprintln!("{e}"),
            }
        }
        tracing::debug!("console thread stopping");
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start() {
        let cmd = parse_line("START checkers/collatz.so collatz::Steps 0 100 out.txt").unwrap();
        assert_eq!(
            cmd,
            Some(Command::Start(StartArgs {
                locator: "checkers/collatz.so".into(),
                checker: "collatz::Steps".into(),
                start: 0,
                end: 100,
                filename: "out.txt".into(),
            }))
        );
    }

    #[test]
    fn parses_disconnect() {
        assert_eq!(parse_line("DISCONNECT").unwrap(), Some(Command::Disconnect));
    }

    #[test]
    fn blank_line_is_ignored() {
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            parse_line("RESTART now"),
            Err(ParseError::Unknown(_))
        ));
        assert!(matches!(
            parse_line("DISCONNECT now"),
            Err(ParseError::Unknown(_))
        ));
    }

    #[test]
    fn start_arity_enforced() {
        assert_eq!(
            parse_line("START a b 0 100"),
            Err(ParseError::StartArity)
        );
        assert_eq!(
            parse_line("START a b 0 100 out.txt extra"),
            Err(ParseError::StartArity)
        );
    }

    #[test]
    fn non_numeric_bound_rejected() {
        assert_eq!(
            parse_line("START a b zero 100 out.txt"),
            Err(ParseError::BadNumber("zero".into()))
        );
    }

    #[test]
    fn inverted_range_rejected() {
        assert_eq!(
            parse_line("START a b 100 0 out.txt"),
            Err(ParseError::BadRange)
        );
    }
}
