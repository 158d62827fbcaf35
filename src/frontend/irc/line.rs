//! RFC 2812 §2.3.1 line parser, grounded directly on the original
//! implementation's `FrontendIRC.parse_line`.

use crate::error::IrcError;

/// `nick!ident@host`, any part of which may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub nick: String,
    pub ident: Option<String>,
    pub host: Option<String>,
}

/// A parsed IRC line: optional prefix, uppercased command, parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
}

/// Parse one IRC line (without trailing CRLF) per RFC 2812 §2.3.1.
///
/// `parse_line("")` raises [`IrcError::EmptyLine`] (testable property 4).
pub fn parse_line(line: &str) -> Result<Message, IrcError> {
    let mut rest = line;
    if rest.is_empty() {
        return Err(IrcError::EmptyLine);
    }

    let mut prefix = None;
    if let Some(stripped) = rest.strip_prefix(':') {
        let (prefix_token, remainder) = split_first_token(stripped)
            .ok_or_else(|| IrcError::Malformed("prefix with no command".to_string()))?;
        prefix = Some(parse_prefix(prefix_token));
        rest = remainder;
    }

    let (command_token, remainder) = split_first_token(rest)
        .ok_or_else(|| IrcError::Malformed("missing command".to_string()))?;
    if command_token.is_empty() {
        return Err(IrcError::Malformed("empty command".to_string()));
    }
    let command = command_token.to_uppercase();

    let params = parse_params(remainder);

    Ok(Message {
        prefix,
        command,
        params,
    })
}

fn parse_prefix(token: &str) -> Prefix {
    if let Some((name, ident_host)) = token.split_once('!') {
        if let Some((ident, host)) = ident_host.split_once('@') {
            return Prefix {
                nick: name.to_string(),
                ident: Some(ident.to_string()),
                host: Some(host.to_string()),
            };
        }
        return Prefix {
            nick: name.to_string(),
            ident: Some(ident_host.to_string()),
            host: None,
        };
    }
    if let Some((name, host)) = token.split_once('@') {
        return Prefix {
            nick: name.to_string(),
            ident: None,
            host: Some(host.to_string()),
        };
    }
    Prefix {
        nick: token.to_string(),
        ident: None,
        host: None,
    }
}

fn parse_params(mut rest: &str) -> Vec<String> {
    let mut params = Vec::new();
    rest = rest.trim_start();
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match split_first_token(rest) {
            Some((token, remainder)) => {
                params.push(token.to_string());
                rest = remainder.trim_start();
            }
            None => break,
        }
    }
    params
}

/// Split on the first run of whitespace, returning (token, remainder).
/// Returns `None` if `s` is empty.
fn split_first_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// Canonical reconstruction of a parsed message, used by the round-trip
/// property test.
pub fn reconstruct(message: &Message) -> String {
    let mut parts = Vec::new();
    if let Some(prefix) = &message.prefix {
        let mut p = format!(":{}", prefix.nick);
        if let Some(ident) = &prefix.ident {
            p.push('!');
            p.push_str(ident);
        }
        if let Some(host) = &prefix.host {
            p.push('@');
            p.push_str(host);
        }
        parts.push(p);
    }
    parts.push(message.command.clone());
    if let Some((last, rest)) = message.params.split_last() {
        parts.extend(rest.iter().cloned());
        if last.is_empty() || last.contains(' ') || last.starts_with(':') {
            parts.push(format!(":{last}"));
        } else {
            parts.push(last.clone());
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_raises() {
        assert!(matches!(parse_line(""), Err(IrcError::EmptyLine)));
    }

    #[test]
    fn all_colons_raises() {
        // Prefix is empty after stripping ':', and there's no command left.
        assert!(parse_line(":::::::::").is_err());
    }

    #[test]
    fn privmsg_without_prefix() {
        let msg = parse_line("PRIVMSG #c :hello").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#c".to_string(), "hello".to_string()]);
    }

    #[test]
    fn privmsg_with_full_prefix() {
        let msg = parse_line(":n!u@h PRIVMSG #c :hi").unwrap();
        assert_eq!(
            msg.prefix,
            Some(Prefix {
                nick: "n".to_string(),
                ident: Some("u".to_string()),
                host: Some("h".to_string()),
            })
        );
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#c".to_string(), "hi".to_string()]);
    }

    #[test]
    fn command_is_case_normalized() {
        let msg = parse_line("privmsg #c :hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn ping_with_single_param() {
        let msg = parse_line("PING :tungsten.example.org").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tungsten.example.org".to_string()]);
    }

    #[test]
    fn numeric_with_multiple_params() {
        let msg = parse_line(":server.example.org 001 dreambot :Welcome").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(
            msg.params,
            vec!["dreambot".to_string(), "Welcome".to_string()]
        );
    }

    /// Testable property 4: canonical reconstruction is byte-equal modulo
    /// command case, for lines whose trailing parameter only needs the `:`
    /// marker when it contains whitespace (the same rule the original
    /// implementation's `send_cmd` uses when building outbound lines).
    #[test]
    fn reconstruction_round_trips() {
        let lines = [
            "PRIVMSG #c :hello there",
            ":n!u@h PRIVMSG #c :hi there",
            ":server.example.org 001 dreambot :multi word trailer",
            "JOIN #bots",
        ];
        for line in lines {
            let parsed = parse_line(line).unwrap();
            let rebuilt = reconstruct(&parsed);
            assert_eq!(rebuilt, line, "line: {line}");
        }
    }
}
