//! Line protocol: splitting input lines and formatting replies.
//!
//! Input is `VERB[ SP ARGUMENT]` terminated by `\n` (a trailing `\r` is
//! dropped). Every reply is a single `\n`-terminated line.

pub const REGISTRATION_TIMEOUT: &str = "ERROR: registration timeout\n";
pub const CONNECTION_TIMEOUT: &str = "ERROR: connection timeout\n";
pub const LINE_TOO_LONG: &str = "ERROR: line too long\n";

/// A command line split into its verb and the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub verb: &'a str,
    pub arg: &'a str,
}

/// Drop the `\n` terminator and at most one `\r` before it.
pub fn trim_line_ending(raw: &str) -> &str {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Split on the first space. A line without a space has an empty argument.
pub fn split_command(line: &str) -> Command<'_> {
    match line.split_once(' ') {
        Some((verb, arg)) => Command { verb, arg },
        None => Command { verb: line, arg: "" },
    }
}

/// Remove one leading `:` from an argument. A lone `:` is left alone.
pub fn strip_colon(arg: &str) -> &str {
    if arg.len() > 1 {
        arg.strip_prefix(':').unwrap_or(arg)
    } else {
        arg
    }
}

pub fn welcome(server_name: &str, session_id: &str) -> String {
    format!("WELCOME {server_name} {session_id}\n")
}

pub fn unknown_command(verb: &str) -> String {
    format!("ERROR: unknown command {verb}\n")
}

pub fn backend_failed(verb: &str, reason: &dyn std::fmt::Display) -> String {
    format!("ERROR: {verb} failed: {reason}\n")
}

/// Keepalive probe carrying the server clock for diagnostics.
pub fn ping_probe(unix_secs: i64) -> String {
    format!("PING :{unix_secs}\n")
}

pub fn pong(token: &str) -> String {
    format!("PONG :{token}\n")
}

pub fn channel_list<'a>(channels: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = String::from("CHANNELS");
    for ch in channels {
        line.push(' ');
        line.push_str(ch);
    }
    line.push('\n');
    line
}

pub fn relayed_message(from: &str, text: &str) -> String {
    format!("MESSAGE {from} :{text}\n")
}
