// src/command/parser.rs - Text line to Command
use super::{CodeType, Command, Parameter};
use crate::channel::Channel;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandParseError {
    #[error("Empty line")]
    Empty,
    #[error("Invalid code number '{0}'")]
    InvalidNumber(String),
    #[error("Duplicate {0} parameter")]
    DuplicateParameter(char),
    #[error("Unterminated string at column {0}")]
    UnterminatedString(usize),
    #[error("Unexpected character '{0}' at column {1}")]
    Unexpected(char, usize),
}

/// Codes whose single unquoted argument is a file name, e.g. `M32 print.gcode`.
const FILENAME_CODES: [i32; 7] = [23, 28, 30, 32, 36, 37, 38];

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// Reads a `"..."` string where `""` is an escaped quote.
    fn quoted(&mut self) -> Result<String, CommandParseError> {
        let start = self.pos;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') if self.peek() == Some('"') => {
                    self.bump();
                    value.push('"');
                }
                Some('"') => return Ok(value),
                Some(c) => value.push(c),
                None => return Err(CommandParseError::UnterminatedString(start)),
            }
        }
    }
}

/// Cuts a `;` comment off, ignoring semicolons inside strings.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

pub fn parse_line(line: &str, channel: Channel) -> Result<Command, CommandParseError> {
    let text = strip_comment(line).trim();
    if text.is_empty() {
        return Err(CommandParseError::Empty);
    }
    let mut scanner = Scanner::new(text);

    // Line numbers are transport detail
    if matches!(scanner.peek(), Some('N' | 'n')) && scanner.rest()[1..].starts_with(|c: char| c.is_ascii_digit()) {
        scanner.bump();
        scanner.take_while(|c| c.is_ascii_digit());
        scanner.skip_whitespace();
    }

    let letter = scanner.peek().ok_or(CommandParseError::Empty)?;
    let code_type = match letter.to_ascii_uppercase() {
        'G' => CodeType::G,
        'M' => CodeType::M,
        'T' => CodeType::T,
        _ => CodeType::Keyword,
    };
    let after_letter = &scanner.rest()[letter.len_utf8()..];
    let numeric = after_letter.is_empty()
        || after_letter.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c.is_whitespace());
    if code_type == CodeType::Keyword || !numeric {
        let keyword = scanner.take_while(|c| !c.is_whitespace()).to_string();
        let mut cmd = Command::new(channel, CodeType::Keyword, None);
        cmd.keyword = Some(keyword);
        cmd.set_raw(text);
        return Ok(cmd);
    }
    scanner.bump();

    let number = scanner.take_while(|c| c.is_ascii_digit() || c == '-');
    let major = if number.is_empty() {
        None
    } else {
        Some(number.parse::<i32>().map_err(|_| CommandParseError::InvalidNumber(number.to_string()))?)
    };
    let mut cmd = Command::new(channel, code_type, major);
    if scanner.peek() == Some('.') {
        scanner.bump();
        let minor = scanner.take_while(|c| c.is_ascii_digit());
        cmd.minor = Some(minor.parse::<i8>().map_err(|_| CommandParseError::InvalidNumber(minor.to_string()))?);
    }
    cmd.set_raw(text);
    scanner.skip_whitespace();

    if code_type == CodeType::M && major.is_some_and(|m| FILENAME_CODES.contains(&m)) {
        let rest = scanner.rest();
        let first = rest.split_whitespace().next().unwrap_or_default();
        if !rest.contains('"') && (first.contains('.') || first.contains('/')) {
            cmd.insert_parameter(Parameter::new('P', rest.trim(), true))?;
            return Ok(cmd);
        }
    }

    while let Some(c) = scanner.peek() {
        if !c.is_ascii_alphabetic() {
            return Err(CommandParseError::Unexpected(c, scanner.pos));
        }
        scanner.bump();
        let parameter = if scanner.peek() == Some('"') {
            Parameter::new(c, scanner.quoted()?, true)
        } else {
            Parameter::new(c, scanner.take_while(|c| !c.is_whitespace()), false)
        };
        cmd.insert_parameter(parameter)?;
        scanner.skip_whitespace();
    }
    Ok(cmd)
}
