//! Single internal command representation

use std::fmt;

/// A command to run: an argument vector, or a raw shell string
///
/// Argument vectors are quoted exactly once, when the command line is
/// built; shell strings are passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Argv(Vec<String>),
    Shell(String),
}

impl Command {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Command::Shell(command.into())
    }

    /// Prepend an interpreter such as `/usr/bin/ruby`
    #[must_use]
    pub fn with_interpreter(self, interpreter: &[String]) -> Self {
        if interpreter.is_empty() {
            return self;
        }
        match self {
            Command::Argv(args) => Command::Argv(interpreter.iter().cloned().chain(args).collect()),
            Command::Shell(command) => Command::Shell(format!("{} {command}", join(interpreter))),
        }
    }

    /// POSIX shell text for this command
    #[must_use]
    pub fn to_shell_string(&self) -> String {
        match self {
            Command::Argv(args) => join(args),
            Command::Shell(command) => command.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

impl From<&str> for Command {
    fn from(command: &str) -> Self {
        Command::Shell(command.to_string())
    }
}

impl From<String> for Command {
    fn from(command: String) -> Self {
        Command::Shell(command)
    }
}

/// Quote one word for a POSIX shell
#[must_use]
pub fn quote(word: &str) -> String {
    shell_words::quote(word).into_owned()
}

/// Quote and join words for a POSIX shell
#[must_use]
pub fn join<S: AsRef<str>>(words: &[S]) -> String {
    shell_words::join(words.iter().map(AsRef::as_ref))
}
