//! Line commands accepted on stdin while the gateway runs.

use thiserror::Error;

use crate::store::DeviceRole;

pub const HELP: &str = "\
commands:
  a <text>             send <text> to device A
  b <text>             send <text> to device B
  connect a|b <port>   (re)connect a device
  disconnect a|b       close a device link
  start | stop         start or stop the HTTP endpoint
  status               show link and gateway state
  ports                list serial ports
  help                 show this message
  quit                 exit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send { role: DeviceRole, text: String },
    Connect { role: DeviceRole, port: String },
    Disconnect { role: DeviceRole },
    Start,
    Stop,
    Status,
    Ports,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown command {0:?}, type `help`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "a" | "b" => {
                if rest.is_empty() {
                    return Err(ConsoleError::Usage("a|b <text>"));
                }
                ConsoleCommand::Send {
                    role: parse_role(word).ok_or(ConsoleError::Usage("a|b <text>"))?,
                    text: rest.to_string(),
                }
            }
            "connect" => {
                let mut parts = rest.split_whitespace();
                let role = parts.next().and_then(parse_role);
                let port = parts.next();
                match (role, port, parts.next()) {
                    (Some(role), Some(port), None) => ConsoleCommand::Connect {
                        role,
                        port: port.to_string(),
                    },
                    _ => return Err(ConsoleError::Usage("connect a|b <port>")),
                }
            }
            "disconnect" => match parse_role(rest) {
                Some(role) => ConsoleCommand::Disconnect { role },
                None => return Err(ConsoleError::Usage("disconnect a|b")),
            },
            "start" => ConsoleCommand::Start,
            "stop" => ConsoleCommand::Stop,
            "status" => ConsoleCommand::Status,
            "ports" => ConsoleCommand::Ports,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            _ => return Err(ConsoleError::Unknown(word.to_string())),
        };
        Ok(Some(command))
    }
}

fn parse_role(text: &str) -> Option<DeviceRole> {
    match text.trim().to_ascii_lowercase().as_str() {
        "a" => Some(DeviceRole::A),
        "b" => Some(DeviceRole::B),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_keeps_the_full_text() {
        assert_eq!(
            ConsoleCommand::parse("a  LED ON  ").unwrap(),
            Some(ConsoleCommand::Send {
                role: DeviceRole::A,
                text: "LED ON".into(),
            })
        );
        assert_eq!(
            ConsoleCommand::parse("B buzz").unwrap(),
            Some(ConsoleCommand::Send {
                role: DeviceRole::B,
                text: "buzz".into(),
            })
        );
        assert_eq!(
            ConsoleCommand::parse("a"),
            Err(ConsoleError::Usage("a|b <text>"))
        );
    }

    #[test]
    fn connect_requires_role_and_port() {
        assert_eq!(
            ConsoleCommand::parse("connect b /dev/ttyUSB1").unwrap(),
            Some(ConsoleCommand::Connect {
                role: DeviceRole::B,
                port: "/dev/ttyUSB1".into(),
            })
        );
        assert!(ConsoleCommand::parse("connect c /dev/ttyUSB1").is_err());
        assert!(ConsoleCommand::parse("connect a").is_err());
    }

    #[test]
    fn keywords_and_blank_lines() {
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert_eq!(ConsoleCommand::parse("STOP").unwrap(), Some(ConsoleCommand::Stop));
        assert_eq!(ConsoleCommand::parse("exit").unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(
            ConsoleCommand::parse("disconnect a").unwrap(),
            Some(ConsoleCommand::Disconnect { role: DeviceRole::A })
        );
        assert_eq!(
            ConsoleCommand::parse("reboot now"),
            Err(ConsoleError::Unknown("reboot".into()))
        );
    }
}
