//! SASL command lines.

use std::fmt;

use super::AuthError;

/// One line of the SASL dialogue, without its `\r\n` terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `AUTH [mechanism [initial-response]]`, response hex-encoded.
    Auth {
        /// Requested mechanism; `None` asks the server to list its own.
        mechanism: Option<String>,
        /// Hex-encoded initial response.
        data: Option<String>,
    },
    /// `DATA <hex>`.
    Data(String),
    /// `OK <server guid>`.
    Ok(String),
    /// `REJECTED <mechanism>...`.
    Rejected(Vec<String>),
    /// `BEGIN`: switch to the binary protocol.
    Begin,
    /// `CANCEL`: abandon the current mechanism.
    Cancel,
    /// `ERROR [message]`.
    Error(String),
}

impl Command {
    /// Parses a line with its terminator already stripped.
    pub fn parse(line: &str) -> Result<Self, AuthError> {
        let invalid = || AuthError::InvalidCommand(line.to_string());
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let command = match word {
            "AUTH" => {
                let mut args = rest.split_whitespace();
                let mechanism = args.next().map(str::to_string);
                let data = args.next().map(str::to_string);
                if args.next().is_some() {
                    return Err(invalid());
                }
                Self::Auth { mechanism, data }
            },
            "DATA" => Self::Data(rest.to_string()),
            "OK" if !rest.is_empty() => Self::Ok(rest.to_string()),
            "REJECTED" => Self::Rejected(rest.split_whitespace().map(str::to_string).collect()),
            "BEGIN" if rest.is_empty() => Self::Begin,
            "CANCEL" if rest.is_empty() => Self::Cancel,
            "ERROR" => Self::Error(rest.to_string()),
            _ => return Err(invalid()),
        };
        Ok(command)
    }

    /// The line as sent, including `\r\n`.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{self}\r\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { mechanism, data } => {
                f.write_str("AUTH")?;
                if let Some(mechanism) = mechanism {
                    write!(f, " {mechanism}")?;
                    if let Some(data) = data {
                        write!(f, " {data}")?;
                    }
                }
                Ok(())
            },
            Self::Data(data) => write!(f, "DATA {data}"),
            Self::Ok(guid) => write!(f, "OK {guid}"),
            Self::Rejected(mechanisms) => {
                f.write_str("REJECTED")?;
                for mechanism in mechanisms {
                    write!(f, " {mechanism}")?;
                }
                Ok(())
            },
            Self::Begin => f.write_str("BEGIN"),
            Self::Cancel => f.write_str("CANCEL"),
            Self::Error(message) if message.is_empty() => f.write_str("ERROR"),
            Self::Error(message) => write!(f, "ERROR {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("AUTH").unwrap(),
            Command::Auth {
                mechanism: None,
                data: None
            }
        );
        assert_eq!(
            Command::parse("AUTH EXTERNAL 31303030").unwrap(),
            Command::Auth {
                mechanism: Some("EXTERNAL".to_string()),
                data: Some("31303030".to_string())
            }
        );
        assert_eq!(
            Command::parse("REJECTED EXTERNAL ANONYMOUS").unwrap(),
            Command::Rejected(vec!["EXTERNAL".to_string(), "ANONYMOUS".to_string()])
        );
        assert_eq!(Command::parse("OK 0123abcd").unwrap(), Command::Ok("0123abcd".to_string()));
        assert_eq!(Command::parse("BEGIN").unwrap(), Command::Begin);
        assert_eq!(Command::parse("ERROR").unwrap(), Command::Error(String::new()));
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "HELLO", "OK", "BEGIN now", "AUTH A B C", "NEGOTIATE_UNIX_FD"] {
            assert!(Command::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_line_format() {
        let line = Command::Auth {
            mechanism: Some("ANONYMOUS".to_string()),
            data: None,
        }
        .to_line();
        assert_eq!(line, "AUTH ANONYMOUS\r\n");
        assert_eq!(
            Command::parse(line.trim_end()).unwrap().to_line(),
            line
        );
    }
}
