//! CLI utilities for framewire.
//!
//! The utilities present in this module can be used to build an interactive client on top of
//! [`crate::client::Client`].
use std::io::{BufRead, Write};

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, also produced at end of input.
    Exit,
    /// Encrypt with the given hex key from now on, `.key <hex>`; `.key` alone goes back to
    /// plaintext.
    Key(Vec<u8>),
    /// Any other line, sent as one message.
    Send(String),
}

/// Prompt user for a command.
///
/// Lines starting with `.` are commands; everything else is a message.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| format!("failed to write prompt: {e}"))?;

    let n = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if n == 0 {
        return Ok(Command::Exit);
    }

    match s.trim_end() {
        ".exit" => Ok(Command::Exit),
        ".key" => Ok(Command::Key(Vec::new())),
        s if s.starts_with(".key ") => parse_key(s[5..].trim()).map(Command::Key),
        s if !s.starts_with('.') => Ok(Command::Send(s.to_string())),
        s => Err(format!("unrecognized command '{}'", s)),
    }
}

/// Parses a hex-encoded key such as `00ff10`.
pub fn parse_key(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("key '{s}' has an odd number of hex digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|byte| u8::from_str_radix(byte, 16).ok())
                .ok_or_else(|| format!("key '{s}' is not valid hex"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_messages() {
        let input = b"hello there\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Send("hello there".into()), res);

        let res = prompt(&b"\n"[..], &mut output).unwrap();
        assert_eq!(Command::Send(String::default()), res);
    }

    #[test]
    fn prompt_exits_at_end_of_input() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b""[..], &mut output).unwrap(), Command::Exit);
    }

    #[test]
    fn prompt_parses_keys() {
        let mut output = Vec::new();

        let res = prompt(&b".key 00ff10\n"[..], &mut output).unwrap();
        assert_eq!(Command::Key(vec![0x00, 0xff, 0x10]), res);

        let res = prompt(&b".key\n"[..], &mut output).unwrap();
        assert_eq!(Command::Key(Vec::new()), res);

        assert!(prompt(&b".key abc\n"[..], &mut output).is_err());
        assert!(prompt(&b".key zz\n"[..], &mut output).is_err());
    }

    #[test]
    #[should_panic(expected = "unrecognized command '.something_wrong'")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }
}
