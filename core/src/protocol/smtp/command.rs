/*
 * command.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a self-hostable mail server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! SMTP command grammar (RFC 5321 §4.1 plus the AUTH/STARTTLS/ETRN
//! extensions). Verbs are case-insensitive; arguments are trimmed.

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// MAIL FROM. The reverse-path may be empty (`<>`, bounces).
    Mail {
        reverse_path: String,
        size: Option<usize>,
    },
    Rcpt {
        forward_path: String,
    },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Expn(String),
    Help(Option<String>),
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Etrn(String),
}

/// Rejection with the reply code the session should send (500 unknown or
/// unparseable, 501 bad arguments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub code: u16,
    pub message: String,
}

impl CommandError {
    fn unknown(verb: &str) -> Self {
        Self {
            code: 500,
            message: format!("5.5.2 Command not recognized: {}", verb),
        }
    }

    fn bad_args(msg: &str) -> Self {
        Self {
            code: 501,
            message: format!("5.5.4 {}", msg),
        }
    }
}

/// Validate an envelope mailbox: `local@domain`, no whitespace or control
/// bytes, exactly one `@`. `postmaster` without a domain is accepted
/// (RFC 5321 §4.5.1).
pub fn valid_address(addr: &str) -> bool {
    if addr.eq_ignore_ascii_case("postmaster") {
        return true;
    }
    if addr.is_empty() || addr.len() > 320 {
        return false;
    }
    if addr.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let mut parts = addr.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let domain = match parts.next() {
        Some(d) => d,
        None => return false,
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .split('.')
        .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

/// Extract the path from `<...>` (angle brackets optional on input, per
/// Postel) and split off any trailing ESMTP parameters. A leading source
/// route (`@relay1,@relay2:`) is stripped.
fn parse_path(arg: &str) -> Result<(String, String), CommandError> {
    let arg = arg.trim_start();
    let (path, rest) = if let Some(stripped) = arg.strip_prefix('<') {
        match stripped.find('>') {
            Some(end) => (&stripped[..end], &stripped[end + 1..]),
            None => return Err(CommandError::bad_args("Unbalanced angle brackets")),
        }
    } else {
        match arg.find(char::is_whitespace) {
            Some(end) => (&arg[..end], &arg[end..]),
            None => (arg, ""),
        }
    };
    let path = match path.rfind(':') {
        Some(colon) if path.starts_with('@') => &path[colon + 1..],
        _ => path,
    };
    Ok((path.to_string(), rest.trim().to_string()))
}

/// Parse MAIL parameters: SIZE=n and BODY=7BIT/8BITMIME are understood,
/// anything else is rejected.
fn parse_mail_params(rest: &str) -> Result<Option<usize>, CommandError> {
    let mut size = None;
    for param in rest.split_whitespace() {
        let (key, value) = match param.split_once('=') {
            Some((k, v)) => (k, v),
            None => (param, ""),
        };
        if key.eq_ignore_ascii_case("SIZE") {
            size = Some(
                value
                    .parse::<usize>()
                    .map_err(|_| CommandError::bad_args("Bad SIZE value"))?,
            );
        } else if key.eq_ignore_ascii_case("BODY") {
            if !value.eq_ignore_ascii_case("7BIT") && !value.eq_ignore_ascii_case("8BITMIME") {
                return Err(CommandError::bad_args("Bad BODY value"));
            }
        } else {
            return Err(CommandError::bad_args("Unrecognized parameter"));
        }
    }
    Ok(size)
}

/// Parse one command line (already stripped of CRLF).
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (verb, args) = match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim()),
        None => (line, ""),
    };
    let upper = verb.to_ascii_uppercase();
    match upper.as_str() {
        "HELO" => {
            if args.is_empty() {
                return Err(CommandError::bad_args("HELO requires a domain"));
            }
            Ok(Command::Helo(args.to_string()))
        }
        "EHLO" => {
            if args.is_empty() {
                return Err(CommandError::bad_args("EHLO requires a domain"));
            }
            Ok(Command::Ehlo(args.to_string()))
        }
        "MAIL" => {
            let rest = strip_prefix_ignore_case(args, "FROM:")
                .ok_or_else(|| CommandError::bad_args("MAIL requires FROM:<address>"))?;
            let (path, params) = parse_path(rest)?;
            if !path.is_empty() && !valid_address(&path) {
                return Err(CommandError::bad_args("Bad sender address"));
            }
            let size = parse_mail_params(&params)?;
            Ok(Command::Mail {
                reverse_path: path,
                size,
            })
        }
        "RCPT" => {
            let rest = strip_prefix_ignore_case(args, "TO:")
                .ok_or_else(|| CommandError::bad_args("RCPT requires TO:<address>"))?;
            let (path, params) = parse_path(rest)?;
            if !params.is_empty() {
                return Err(CommandError::bad_args("Unrecognized parameter"));
            }
            if path.is_empty() || !valid_address(&path) {
                return Err(CommandError::bad_args("Bad recipient address"));
            }
            Ok(Command::Rcpt { forward_path: path })
        }
        "DATA" => {
            if !args.is_empty() {
                return Err(CommandError::bad_args("DATA takes no arguments"));
            }
            Ok(Command::Data)
        }
        "RSET" => {
            if !args.is_empty() {
                return Err(CommandError::bad_args("RSET takes no arguments"));
            }
            Ok(Command::Rset)
        }
        "NOOP" => Ok(Command::Noop),
        "QUIT" => Ok(Command::Quit),
        "VRFY" => {
            if args.is_empty() {
                return Err(CommandError::bad_args("VRFY requires an argument"));
            }
            Ok(Command::Vrfy(args.to_string()))
        }
        "EXPN" => {
            if args.is_empty() {
                return Err(CommandError::bad_args("EXPN requires an argument"));
            }
            Ok(Command::Expn(args.to_string()))
        }
        "HELP" => Ok(Command::Help(if args.is_empty() {
            None
        } else {
            Some(args.to_string())
        })),
        "STARTTLS" => {
            if !args.is_empty() {
                return Err(CommandError::bad_args("STARTTLS takes no arguments"));
            }
            Ok(Command::StartTls)
        }
        "AUTH" => {
            if args.is_empty() {
                return Err(CommandError::bad_args("AUTH requires a mechanism"));
            }
            let mut words = args.splitn(2, char::is_whitespace);
            let mechanism = words.next().unwrap_or("").to_ascii_uppercase();
            let initial = words.next().map(|s| s.trim().to_string());
            Ok(Command::Auth { mechanism, initial })
        }
        "ETRN" => {
            if args.is_empty() {
                return Err(CommandError::bad_args("ETRN requires a node name"));
            }
            Ok(Command::Etrn(args.to_string()))
        }
        "" => Err(CommandError::unknown("(empty)")),
        _ => Err(CommandError::unknown(verb)),
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(parse("ehlo client.example").unwrap(), Command::Ehlo("client.example".into()));
        assert_eq!(parse("QuIt").unwrap(), Command::Quit);
        assert_eq!(parse("noop with junk").unwrap(), Command::Noop);
    }

    #[test]
    fn mail_from_with_and_without_brackets() {
        assert_eq!(
            parse("MAIL FROM:<a@x.example>").unwrap(),
            Command::Mail {
                reverse_path: "a@x.example".into(),
                size: None
            }
        );
        assert_eq!(
            parse("mail from: a@x.example").unwrap(),
            Command::Mail {
                reverse_path: "a@x.example".into(),
                size: None
            }
        );
    }

    #[test]
    fn null_reverse_path_is_legal() {
        assert_eq!(
            parse("MAIL FROM:<>").unwrap(),
            Command::Mail {
                reverse_path: String::new(),
                size: None
            }
        );
    }

    #[test]
    fn mail_size_parameter() {
        assert_eq!(
            parse("MAIL FROM:<a@x.example> SIZE=2048").unwrap(),
            Command::Mail {
                reverse_path: "a@x.example".into(),
                size: Some(2048)
            }
        );
        assert_eq!(parse("MAIL FROM:<a@x.example> SIZE=big").unwrap_err().code, 501);
        assert_eq!(
            parse("MAIL FROM:<a@x.example> BODY=8BITMIME").unwrap(),
            Command::Mail {
                reverse_path: "a@x.example".into(),
                size: None
            }
        );
        assert_eq!(parse("MAIL FROM:<a@x.example> FUTURE=1").unwrap_err().code, 501);
    }

    #[test]
    fn source_routes_are_stripped() {
        assert_eq!(
            parse("RCPT TO:<@relay.example:user@dest.example>").unwrap(),
            Command::Rcpt {
                forward_path: "user@dest.example".into()
            }
        );
    }

    #[test]
    fn rcpt_rejects_bad_addresses() {
        assert_eq!(parse("RCPT TO:<>").unwrap_err().code, 501);
        assert_eq!(parse("RCPT TO:<no-domain>").unwrap_err().code, 501);
        assert_eq!(parse("RCPT TO:<a b@x.example>").unwrap_err().code, 501);
        assert_eq!(parse("RCPT TO:<a@x@y>").unwrap_err().code, 501);
        assert_eq!(
            parse("RCPT TO:<postmaster>").unwrap(),
            Command::Rcpt {
                forward_path: "postmaster".into()
            }
        );
    }

    #[test]
    fn address_validation() {
        assert!(valid_address("user@example.com"));
        assert!(valid_address("u.ser+tag@sub.example-host.com"));
        assert!(valid_address("POSTMASTER"));
        assert!(!valid_address(""));
        assert!(!valid_address("@example.com"));
        assert!(!valid_address("user@"));
        assert!(!valid_address("user@exa mple.com"));
        assert!(!valid_address("user@bad..domain"));
    }

    #[test]
    fn auth_with_and_without_initial_response() {
        assert_eq!(
            parse("AUTH PLAIN AGFsaWNlAHNla3JpdA==").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".into(),
                initial: Some("AGFsaWNlAHNla3JpdA==".into())
            }
        );
        assert_eq!(
            parse("auth login").unwrap(),
            Command::Auth {
                mechanism: "LOGIN".into(),
                initial: None
            }
        );
    }

    #[test]
    fn strict_argument_checks() {
        assert_eq!(parse("DATA now").unwrap_err().code, 501);
        assert_eq!(parse("STARTTLS please").unwrap_err().code, 501);
        assert_eq!(parse("EHLO").unwrap_err().code, 501);
        assert_eq!(parse("ETRN").unwrap_err().code, 501);
        assert_eq!(parse("BDAT 100").unwrap_err().code, 500);
        assert_eq!(parse("").unwrap_err().code, 500);
    }

    #[test]
    fn etrn_keeps_raw_argument() {
        assert_eq!(parse("ETRN example.com").unwrap(), Command::Etrn("example.com".into()));
        assert_eq!(parse("ETRN @node.example").unwrap(), Command::Etrn("@node.example".into()));
        assert_eq!(parse("ETRN #slow").unwrap(), Command::Etrn("#slow".into()));
    }
}
