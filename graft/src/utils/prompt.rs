//! Interactive confirmation
//!
//! Every destructive or conflict-resolution path asks through a [`Prompter`],
//! so the engine runs the same way under a TTY, in CI and in tests.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Source of answers for yes/no questions and menus
pub trait Prompter: Send + Sync {
    /// Ask a yes/no question
    fn confirm(&self, message: &str) -> Result<bool>;

    /// Ask the user to pick one of `options`, returning its index
    fn choose(&self, message: &str, options: &[String]) -> Result<usize>;
}

/// Reads answers from stdin
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompter;

impl StdinPrompter {
    fn read_line(&self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl Prompter for StdinPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        print!("{} [y/N]: ", message);
        io::stdout().flush()?;

        // EOF means nobody is there to say yes
        Ok(matches!(
            self.read_line()?.as_deref().map(str::to_lowercase).as_deref(),
            Some("y") | Some("yes")
        ))
    }

    fn choose(&self, message: &str, options: &[String]) -> Result<usize> {
        println!("{}", message);
        for (i, option) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, option);
        }

        loop {
            print!("Select an option [1-{}]: ", options.len());
            io::stdout().flush()?;

            let Some(answer) = self.read_line()? else {
                return Err(Error::Cancelled("no answer on stdin".to_string()));
            };
            match answer.parse::<usize>() {
                Ok(n) if n >= 1 && n <= options.len() => return Ok(n - 1),
                _ => println!("Please enter a number between 1 and {}", options.len()),
            }
        }
    }
}

/// A recorded answer for [`ScriptedPrompter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    /// Pick the first option whose label contains this text
    Choose(String),
}

/// Replays a fixed list of answers. Useful for non-interactive callers and tests.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<Answer>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Questions asked so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn next(&self, message: &str) -> Result<Answer> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(message.to_string());
        }

        self.answers
            .lock()
            .map_err(|_| Error::Unknown("prompter lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| Error::Cancelled(format!("no scripted answer for '{}'", message)))
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        Ok(matches!(self.next(message)?, Answer::Yes))
    }

    fn choose(&self, message: &str, options: &[String]) -> Result<usize> {
        match self.next(message)? {
            Answer::Choose(label) => options
                .iter()
                .position(|o| o.contains(&label))
                .ok_or_else(|| Error::Cancelled(format!("no option matching '{}'", label))),
            other => Err(Error::Cancelled(format!(
                "expected a menu choice for '{}', got {:?}",
                message, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scripted_prompter_replays_in_order() {
        let prompter = ScriptedPrompter::new([
            Answer::Yes,
            Answer::Choose("Cancel".to_string()),
            Answer::No,
        ]);
        let options = vec!["Force continue".to_string(), "Cancel".to_string()];

        assert!(prompter.confirm("first?").unwrap());
        assert_eq!(prompter.choose("pick", &options).unwrap(), 1);
        assert!(!prompter.confirm("third?").unwrap());
        assert!(matches!(prompter.confirm("fourth?"), Err(Error::Cancelled(_))));
        assert_eq!(prompter.asked().len(), 4);
    }
}
