use crate::error::SpecError;
use derive_builder::{Builder, UninitializedFieldError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Split a command line into argv tokens using POSIX shell-word rules.
///
/// Single and double quotes group words, backslashes escape the next
/// character. The result must contain at least the executable.
pub fn tokenize(line: &str) -> Result<Vec<String>, SpecError> {
    let tokens = shlex::split(line).ok_or_else(|| SpecError::Tokenize {
        input: line.to_string(),
    })?;
    if tokens.is_empty() {
        return Err(SpecError::EmptyCommand);
    }
    Ok(tokens)
}

/// Description of one child process to launch
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(
    setter(into, strip_option),
    build_fn(validate = "Self::validate", error = "SpecError")
)]
pub struct ProcessSpec {
    /// Label used in logs and errors, defaults to the command
    #[builder(default)]
    pub name: Option<String>,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    /// When set, the child sees exactly this environment
    #[builder(default)]
    #[builder(setter(custom))]
    pub environment: Option<HashMap<String, String>>,
    #[builder(default)]
    pub stdout: Option<PathBuf>,
    #[builder(default)]
    pub stderr: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }

    /// Build a spec from a single shell command string
    pub fn shell(line: &str) -> Result<Self, SpecError> {
        Self::from_argv(tokenize(line)?)
    }

    /// Build a spec from pre-split argv tokens
    pub fn from_argv<S, I>(argv: I) -> Result<Self, SpecError>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let command = argv.next().ok_or(SpecError::EmptyCommand)?;
        Self::builder().command(command).args(argv).build()
    }

    /// The full argv, executable first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.command)
    }
}

impl FromStr for ProcessSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::shell(s)
    }
}

impl ProcessSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    /// Add one variable to the explicit environment.
    ///
    /// The first call switches the child from inheriting the parent
    /// environment to seeing only what was set here.
    pub fn env<K: ToString, V: ToString>(&mut self, key: K, value: V) -> &mut Self {
        self.env_map().insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T, I>(&mut self, iter: I) -> &mut Self
    where
        T: ToString,
        I: IntoIterator<Item = (T, T)>,
    {
        let env = self.env_map();
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Copy the current process environment into the explicit environment.
    /// Variables already set on this builder win.
    pub fn inherit_env(&mut self) -> &mut Self {
        let env = self.env_map();
        for (key, value) in std::env::vars() {
            env.entry(key).or_insert(value);
        }
        self
    }

    fn env_map(&mut self) -> &mut HashMap<String, String> {
        self.environment
            .get_or_insert_with(|| Some(HashMap::new()))
            .get_or_insert_with(HashMap::new)
    }

    fn validate(&self) -> Result<(), SpecError> {
        match &self.command {
            Some(command) if command.is_empty() => Err(SpecError::EmptyCommand),
            _ => Ok(()),
        }
    }
}

impl From<UninitializedFieldError> for SpecError {
    fn from(_: UninitializedFieldError) -> Self {
        SpecError::EmptyCommand
    }
}

/// Command given either as one shell string or as argv tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn resolve(&self) -> Result<Vec<String>, SpecError> {
        match self {
            CommandLine::Shell(line) => tokenize(line),
            CommandLine::Argv(argv) if argv.is_empty() => Err(SpecError::EmptyCommand),
            CommandLine::Argv(argv) => Ok(argv.clone()),
        }
    }
}

/// Object form of a spec as it appears in launch plans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FullSpec {
    pub command: CommandLine,
    #[serde(default, rename = "cwd")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, rename = "env")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
}

/// Caller-facing spec input: a bare shell string or a full object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecInput {
    Shell(String),
    Full(FullSpec),
}

impl TryFrom<SpecInput> for ProcessSpec {
    type Error = SpecError;

    fn try_from(input: SpecInput) -> Result<Self, Self::Error> {
        match input {
            SpecInput::Shell(line) => ProcessSpec::shell(&line),
            SpecInput::Full(full) => {
                let mut argv = full.command.resolve()?.into_iter();
                let command = argv.next().ok_or(SpecError::EmptyCommand)?;
                Ok(ProcessSpec {
                    name: full.name,
                    command,
                    args: argv.collect(),
                    working_directory: full.working_directory,
                    environment: full.environment,
                    stdout: full.stdout,
                    stderr: full.stderr,
                })
            }
        }
    }
}
