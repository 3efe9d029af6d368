//! Raw IRC protocol line construction and parsing.
//!
//! Builders return a line with the trailing `\r\n` already attached, ready
//! to hand to the writer task. The parser is intentionally minimal: this
//! daemon only ever needs to recognise a handful of numerics and commands
//! (§4.3), never full conversational IRC.

/// IRC framing limits a single line to 512 bytes including the trailing
/// CRLF. We reserve the rest for `PRIVMSG <chan> :` framing overhead.
pub const MAX_LINE_LEN: usize = 510;

pub fn nick(n: &str) -> String {
    format!("NICK {n}\r\n")
}

pub fn user(username: &str, realname: &str) -> String {
    format!("USER {username} 0 * :{realname}\r\n")
}

pub fn join(channel: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("JOIN {channel} {key}\r\n"),
        None => format!("JOIN {channel}\r\n"),
    }
}

pub fn part(channel: &str) -> String {
    format!("PART {channel}\r\n")
}

pub fn privmsg(target: &str, message: &str) -> String {
    format!("PRIVMSG {target} :{message}\r\n")
}

pub fn pong(token: &str) -> String {
    format!("PONG :{token}\r\n")
}

pub fn ping(token: &str) -> String {
    format!("PING :{token}\r\n")
}

pub fn quit(reason: &str) -> String {
    format!("QUIT :{reason}\r\n")
}

/// A parsed incoming IRC line: `[:prefix] COMMAND [params...] [:trailing]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Line {
    /// Parameter at `idx`, including the trailing parameter if it's last.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// The nick portion of `prefix`, i.e. everything before the first `!`.
    pub fn prefix_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split(['!', '@']).next().unwrap_or(p))
    }
}

/// Parse one CRLF-stripped IRC line. Returns `None` for a blank line.
pub fn parse_line(line: &str) -> Option<Line> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }

    let mut rest = line;
    let prefix = if let Some(stripped) = rest.strip_prefix(':') {
        let (prefix, remainder) = stripped.split_once(' ')?;
        rest = remainder.trim_start();
        Some(prefix.to_string())
    } else {
        None
    };

    let (command, mut rest) = match rest.split_once(' ') {
        Some((command, remainder)) => (command, remainder),
        None => (rest, ""),
    };
    if command.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((param, remainder)) => {
                params.push(param.to_string());
                rest = remainder;
            }
            None => {
                params.push(rest.to_string());
                break;
            }
        }
    }

    Some(Line {
        prefix,
        command: command.to_ascii_uppercase(),
        params,
    })
}

/// Split `text` into IRC-safe `PRIVMSG` lines, preferring to break on
/// whitespace within [`MAX_LINE_LEN`] and falling back to a hard cut when no
/// whitespace is available. Order is preserved across the returned vector.
pub fn split_for_privmsg(target: &str, text: &str, limit: usize) -> Vec<String> {
    // "PRIVMSG <target> :" + CRLF overhead that eats into the budget for
    // the message body itself.
    let overhead = "PRIVMSG ".len() + target.len() + " :".len() + "\r\n".len();
    let budget = limit.saturating_sub(overhead).max(1);

    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= budget {
            out.push(remaining.to_string());
            break;
        }
        let mut cut = budget;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let candidate = &remaining[..cut];
        let split_at = candidate.rfind(' ').map(|i| i + 1).unwrap_or(cut);
        let split_at = if split_at == 0 { cut } else { split_at };
        out.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_attach_crlf() {
        assert_eq!(nick("bot"), "NICK bot\r\n");
        assert_eq!(join("#chan", None), "JOIN #chan\r\n");
        assert_eq!(join("#chan", Some("key")), "JOIN #chan key\r\n");
        assert_eq!(privmsg("#chan", "hi"), "PRIVMSG #chan :hi\r\n");
    }

    #[test]
    fn parses_ping() {
        let line = parse_line("PING :token123").unwrap();
        assert_eq!(line.command, "PING");
        assert_eq!(line.param(0), Some("token123"));
    }

    #[test]
    fn parses_welcome_numeric_with_prefix() {
        let line = parse_line(":irc.example.net 001 mybot :Welcome to the network").unwrap();
        assert_eq!(line.prefix.as_deref(), Some("irc.example.net"));
        assert_eq!(line.command, "001");
        assert_eq!(line.param(0), Some("mybot"));
        assert_eq!(line.param(1), Some("Welcome to the network"));
    }

    #[test]
    fn parses_join_echo() {
        let line = parse_line(":mybot!user@host JOIN #chan").unwrap();
        assert_eq!(line.prefix_nick(), Some("mybot"));
        assert_eq!(line.command, "JOIN");
        assert_eq!(line.param(0), Some("#chan"));
    }

    #[test]
    fn parses_kick_with_trailing_reason() {
        let line = parse_line(":op!u@h KICK #chan mybot :spamming").unwrap();
        assert_eq!(line.command, "KICK");
        assert_eq!(line.param(0), Some("#chan"));
        assert_eq!(line.param(1), Some("mybot"));
        assert_eq!(line.param(2), Some("spamming"));
    }

    #[test]
    fn blank_line_is_none() {
        assert!(parse_line("").is_none());
        assert!(parse_line("\r\n").is_none());
    }

    #[test]
    fn short_message_is_not_split() {
        let lines = split_for_privmsg("#chan", "hello world", 510);
        assert_eq!(lines, vec!["hello world".to_string()]);
    }

    #[test]
    fn long_message_splits_on_whitespace() {
        let word = "abcde ";
        let text = word.repeat(100); // 600 bytes, well over budget
        let lines = split_for_privmsg("#chan", text.trim_end(), 100);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() + "PRIVMSG #chan :".len() + 2 <= 100);
        }
        // Order preserved: re-joining with a space reconstructs the input.
        assert_eq!(lines.join(" "), text.trim_end());
    }

    #[test]
    fn long_word_with_no_whitespace_hard_cuts() {
        let text = "x".repeat(300);
        let lines = split_for_privmsg("#chan", &text, 100);
        assert!(lines.len() > 1);
        assert_eq!(lines.concat(), text);
    }
}
