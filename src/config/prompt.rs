//! Operator prompts.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use crate::error::InstallError;

/// Source of answers to configuration questions.
pub trait Prompter {
    /// Yes/no question. An empty answer picks `default`.
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool, InstallError>;

    /// Free-form question. An empty answer picks `default`.
    fn ask(&mut self, question: &str, default: &str) -> Result<String, InstallError>;
}

fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Prompts on a terminal (or any reader/writer pair).
///
/// End of input answers every remaining question with its default.
pub struct TerminalPrompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> TerminalPrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_answer(&mut self, prompt: &str) -> Result<Option<String>, InstallError> {
        write!(self.output, "{} ", prompt)
            .and_then(|_| self.output.flush())
            .map_err(|e| InstallError::Config(format!("writing prompt: {}", e)))?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .map_err(|e| InstallError::Config(format!("reading answer: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> Prompter for TerminalPrompter<R, W> {
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool, InstallError> {
        let suffix = if default { "[Y/n]" } else { "[y/N]" };
        loop {
            let Some(answer) = self.read_answer(&format!("{} {}", question, suffix))? else {
                return Ok(default);
            };
            if answer.is_empty() {
                return Ok(default);
            }
            if let Some(value) = parse_yes_no(&answer) {
                return Ok(value);
            }
            let _ = writeln!(self.output, "Please answer 'y' or 'n'.");
        }
    }

    fn ask(&mut self, question: &str, default: &str) -> Result<String, InstallError> {
        match self.read_answer(&format!("{} [{}]:", question, default))? {
            Some(answer) if !answer.is_empty() => Ok(answer),
            _ => Ok(default.to_string()),
        }
    }
}

/// Answers questions from a fixed script and remembers what was asked.
///
/// Running out of answers is treated like end of input: defaults apply.
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    asked: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }

    pub fn asked(&self) -> &[String] {
        &self.asked
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool, InstallError> {
        self.asked.push(question.to_string());
        match self.answers.pop_front() {
            Some(answer) if !answer.trim().is_empty() => parse_yes_no(&answer).ok_or_else(|| {
                InstallError::Config(format!("unexpected answer '{}' to '{}'", answer, question))
            }),
            _ => Ok(default),
        }
    }

    fn ask(&mut self, question: &str, default: &str) -> Result<String, InstallError> {
        self.asked.push(question.to_string());
        match self.answers.pop_front() {
            Some(answer) if !answer.trim().is_empty() => Ok(answer),
            _ => Ok(default.to_string()),
        }
    }
}
