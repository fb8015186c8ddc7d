// src/command/mod.rs - Parsed codes, their parameters and results
pub mod parser;

use crate::channel::Channel;
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use parser::CommandParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeType {
    G,
    M,
    T,
    /// Anything that is not a numeric code, e.g. a meta keyword.
    Keyword,
}

impl CodeType {
    pub fn letter(self) -> Option<char> {
        match self {
            CodeType::G => Some('G'),
            CodeType::M => Some('M'),
            CodeType::T => Some('T'),
            CodeType::Keyword => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Read from a job or macro file rather than typed by a user.
        const FROM_FILE = 0b0001;
        /// Requested by the firmware itself (e.g. a macro or file request).
        const FROM_FIRMWARE = 0b0010;
        /// Out-of-band code that bypasses the normal queue.
        const PRIORITIZED = 0b0100;
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Missing {0} parameter")]
    Missing(char),
    #[error("Invalid {letter} parameter '{value}'")]
    Invalid { letter: char, value: String },
}

/// A single letter-keyed parameter. The value is kept as written and
/// converted on access.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub letter: char,
    pub value: String,
    pub quoted: bool,
}

impl Parameter {
    pub fn new(letter: char, value: impl Into<String>, quoted: bool) -> Self {
        Self { letter: letter.to_ascii_uppercase(), value: value.into(), quoted }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn as_i64(&self) -> Result<i64, ParameterError> {
        self.value.trim().parse::<i64>().or_else(|_| {
            // RRF accepts integral floats for integer parameters
            self.value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
                .ok_or_else(|| self.invalid())
        })
    }

    pub fn as_u64(&self) -> Result<u64, ParameterError> {
        let value = self.as_i64()?;
        u64::try_from(value).map_err(|_| self.invalid())
    }

    pub fn as_f64(&self) -> Result<f64, ParameterError> {
        self.value.trim().parse::<f64>().map_err(|_| self.invalid())
    }

    pub fn as_bool(&self) -> Result<bool, ParameterError> {
        if self.value.is_empty() {
            return Ok(true);
        }
        Ok(self.as_i64()? > 0)
    }

    fn invalid(&self) -> ParameterError {
        ParameterError::Invalid { letter: self.letter, value: self.value.clone() }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.quoted {
            write!(f, "{}\"{}\"", self.letter, self.value.replace('"', "\"\""))
        } else {
            write!(f, "{}{}", self.letter, self.value)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Success,
    Warning,
    Error,
}

/// A code result: a kind and free text.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

impl Message {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Success, text)
    }

    /// Empty success, the plain "ok" of a handled code.
    pub fn ok() -> Self {
        Self::new(MessageKind::Success, String::new())
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, text)
    }

    pub fn is_success(&self) -> bool {
        self.kind == MessageKind::Success
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    pub fn append_line(&mut self, line: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(line);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::Success => f.write_str(&self.text),
            MessageKind::Warning => write!(f, "Warning: {}", self.text),
            MessageKind::Error => write!(f, "Error: {}", self.text),
        }
    }
}

impl From<ParameterError> for Message {
    fn from(e: ParameterError) -> Self {
        Message::error(e.to_string())
    }
}

/// One parsed instruction together with its origin, cancellation signal and
/// result slot.
#[derive(Debug, Clone)]
pub struct Command {
    pub channel: Channel,
    pub code_type: CodeType,
    pub major: Option<i32>,
    pub minor: Option<i8>,
    pub keyword: Option<String>,
    pub flags: CommandFlags,
    parameters: BTreeMap<char, Parameter>,
    raw: Option<String>,
    line: Option<String>,
    cancellation: CancellationToken,
    sequence: Option<u64>,
    result: Option<Message>,
}

impl Command {
    pub fn new(channel: Channel, code_type: CodeType, major: Option<i32>) -> Self {
        Self {
            channel,
            code_type,
            major,
            minor: None,
            keyword: None,
            flags: CommandFlags::empty(),
            parameters: BTreeMap::new(),
            raw: None,
            line: None,
            cancellation: CancellationToken::new(),
            sequence: None,
            result: None,
        }
    }

    /// Shorthand for an `M` code without parameters.
    pub fn mcode(channel: Channel, major: i32) -> Self {
        Self::new(channel, CodeType::M, Some(major))
    }

    pub fn parse(line: &str, channel: Channel) -> Result<Self, CommandParseError> {
        let mut command = parser::parse_line(line, channel)?;
        command.set_line(line);
        Ok(command)
    }

    pub fn with_minor(mut self, minor: i8) -> Self {
        self.minor = Some(minor);
        self
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Adds a parameter. Parameter letters are unique, so a second value
    /// for the same letter is refused.
    pub fn with_parameter(mut self, parameter: Parameter) -> Result<Self, CommandParseError> {
        self.insert_parameter(parameter)?;
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub(crate) fn insert_parameter(&mut self, parameter: Parameter) -> Result<(), CommandParseError> {
        if self.parameters.contains_key(&parameter.letter) {
            return Err(CommandParseError::DuplicateParameter(parameter.letter));
        }
        self.parameters.insert(parameter.letter, parameter);
        Ok(())
    }

    pub(crate) fn set_raw(&mut self, raw: &str) {
        self.raw = Some(raw.to_string());
    }

    pub(crate) fn set_line(&mut self, line: &str) {
        self.line = Some(line.trim_end_matches(['\r', '\n']).to_string());
    }

    /// The line exactly as received, comments included. Uploads store this.
    pub fn line(&self) -> Option<&str> {
        self.line.as_deref()
    }

    pub fn is(&self, code_type: CodeType, major: i32) -> bool {
        self.code_type == code_type && self.major == Some(major)
    }

    pub fn is_from_file(&self) -> bool {
        self.flags.contains(CommandFlags::FROM_FILE)
    }

    pub fn is_from_firmware(&self) -> bool {
        self.flags.contains(CommandFlags::FROM_FIRMWARE)
    }

    pub fn is_prioritized(&self) -> bool {
        self.flags.contains(CommandFlags::PRIORITIZED)
    }

    pub fn parameter(&self, letter: char) -> Option<&Parameter> {
        self.parameters.get(&letter.to_ascii_uppercase())
    }

    pub fn has_parameter(&self, letter: char) -> bool {
        self.parameter(letter).is_some()
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    pub fn required(&self, letter: char) -> Result<&Parameter, ParameterError> {
        self.parameter(letter).ok_or(ParameterError::Missing(letter))
    }

    pub fn string_or(&self, letter: char, default: &str) -> String {
        self.parameter(letter).map(|p| p.value.clone()).unwrap_or_else(|| default.to_string())
    }

    pub fn i64_or(&self, letter: char, default: i64) -> Result<i64, ParameterError> {
        self.parameter(letter).map(Parameter::as_i64).unwrap_or(Ok(default))
    }

    pub fn bool_or(&self, letter: char, default: bool) -> Result<bool, ParameterError> {
        self.parameter(letter).map(Parameter::as_bool).unwrap_or(Ok(default))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Gives the code a fresh cancellation signal so it still reaches the
    /// firmware after the original one fired.
    pub fn reset_cancellation(&mut self) {
        self.cancellation = CancellationToken::new();
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    pub fn result(&self) -> Option<&Message> {
        self.result.as_ref()
    }

    pub fn result_mut(&mut self) -> Option<&mut Message> {
        self.result.as_mut()
    }

    /// Fills the result slot. The slot is written exactly once; a second
    /// attempt hands the message back.
    pub fn set_result(&mut self, message: Message) -> Result<(), Message> {
        if self.result.is_some() {
            return Err(message);
        }
        self.result = Some(message);
        Ok(())
    }

    /// The code as text, preferring the line it was parsed from.
    pub fn text(&self) -> String {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code_type.letter() {
            Some(letter) => {
                write!(f, "{}", letter)?;
                if let Some(major) = self.major {
                    write!(f, "{}", major)?;
                }
                if let Some(minor) = self.minor {
                    write!(f, ".{}", minor)?;
                }
            }
            None => write!(f, "{}", self.keyword.as_deref().unwrap_or_default())?,
        }
        for parameter in self.parameters.values() {
            write!(f, " {}", parameter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_slot_is_written_once() {
        let mut cmd = Command::mcode(Channel::Http, 115);
        assert!(cmd.set_result(Message::ok()).is_ok());
        let rejected = cmd.set_result(Message::error("late")).unwrap_err();
        assert_eq!(rejected.text, "late");
        assert!(cmd.result().unwrap().is_success());
    }

    #[test]
    fn duplicate_parameters_are_refused() {
        let cmd = Command::mcode(Channel::Http, 471)
            .with_parameter(Parameter::new('S', "a", true))
            .unwrap();
        assert!(cmd.with_parameter(Parameter::new('s', "b", true)).is_err());
    }

    #[test]
    fn reset_cancellation_gives_a_live_token() {
        let mut cmd = Command::mcode(Channel::File, 0);
        cmd.cancellation().cancel();
        assert!(cmd.is_cancelled());
        cmd.reset_cancellation();
        assert!(!cmd.is_cancelled());
    }

    #[test]
    fn display_quotes_strings() {
        let cmd = Command::mcode(Channel::Http, 28)
            .with_parameter(Parameter::new('P', "my \"file\".gcode", true))
            .unwrap();
        assert_eq!(cmd.to_string(), "M28 P\"my \"\"file\"\".gcode\"");
    }

    #[test]
    fn integral_floats_are_integers() {
        assert_eq!(Parameter::new('S', "3.0", false).as_i64().unwrap(), 3);
        assert!(Parameter::new('S', "3.5", false).as_i64().is_err());
        assert!(Parameter::new('S', "-1", false).as_u64().is_err());
    }

    #[test]
    fn received_line_keeps_comments() {
        let cmd = Command::parse("G1 X1 ; first move\r\n", Channel::Usb).unwrap();
        assert_eq!(cmd.text(), "G1 X1");
        assert_eq!(cmd.line(), Some("G1 X1 ; first move"));
        assert_eq!(Command::mcode(Channel::Usb, 29).line(), None);
    }
}
