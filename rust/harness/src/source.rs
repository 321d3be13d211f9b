//! Configuration value resolution: config file, then operator prompt, then default.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, BufRead, Write},
};

use hyperpod_config::{RunMode, parse_yes_no};

use crate::config::ConfigDocument;

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    File,
    Prompt,
    Default,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Prompt => write!(f, "prompt"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// A resolved configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub key: String,
    pub value: String,
    pub source: Provenance,
}

/// Source of interactive answers.
pub trait Prompter {
    /// Ask `prompt` and return the raw answer (possibly empty).
    fn ask(&mut self, prompt: &str, default: &str) -> io::Result<String>;
}

impl<P: Prompter + ?Sized> Prompter for &mut P {
    fn ask(&mut self, prompt: &str, default: &str) -> io::Result<String> {
        (**self).ask(prompt, default)
    }
}

/// Reads answers from the terminal.
#[derive(Debug, Default)]
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&mut self, prompt: &str, default: &str) -> io::Result<String> {
        let mut stdout = io::stdout();
        if default.is_empty() {
            write!(stdout, "{prompt}: ")?;
        } else {
            write!(stdout, "{prompt} [{default}]: ")?;
        }
        stdout.flush()?;

        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stdin closed",
            ));
        }
        Ok(input.trim().to_string())
    }
}

/// Replays canned answers in order; errors once they run out.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    replies: Vec<(String, String)>,
    asked: Vec<String>,
}

impl ScriptedPrompter {
    #[must_use]
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            replies: Vec::new(),
            asked: Vec::new(),
        }
    }

    /// Answer the next prompt containing `fragment` with `answer`, ahead of
    /// the ordered answers. Each reply is used once.
    #[must_use]
    pub fn replying(mut self, fragment: impl Into<String>, answer: impl Into<String>) -> Self {
        self.replies.push((fragment.into(), answer.into()));
        self
    }

    /// Prompts asked so far.
    #[must_use]
    pub fn asked(&self) -> &[String] {
        &self.asked
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, prompt: &str, _default: &str) -> io::Result<String> {
        self.asked.push(prompt.to_string());
        if let Some(i) = self.replies.iter().position(|(f, _)| prompt.contains(f.as_str())) {
            return Ok(self.replies.remove(i).1);
        }
        self.answers.pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer left")
        })
    }
}

/// Resolves configuration values for one pipeline run.
///
/// Resolutions are cached per key, so asking twice never re-prompts.
pub struct ConfigSource<P: Prompter> {
    document: Option<ConfigDocument>,
    mode: RunMode,
    prompter: P,
    cache: HashMap<String, ConfigValue>,
}

impl<P: Prompter> ConfigSource<P> {
    #[must_use]
    pub fn new(document: Option<ConfigDocument>, mode: RunMode, prompter: P) -> Self {
        Self {
            document,
            mode,
            prompter,
            cache: HashMap::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    #[must_use]
    pub fn document(&self) -> Option<&ConfigDocument> {
        self.document.as_ref()
    }

    #[must_use]
    pub fn prompter(&self) -> &P {
        &self.prompter
    }

    /// Resolve `key`: file value, else default in automated mode, else prompt.
    pub fn resolve(&mut self, key: &str, default: &str, prompt_text: &str) -> ConfigValue {
        if let Some(cached) = self.cache.get(key) {
            return cached.clone();
        }

        let (value, source) = if let Some(v) = self.document.as_ref().and_then(|d| d.get(key)) {
            (v, Provenance::File)
        } else if self.mode.is_automated() {
            (default.to_string(), Provenance::Default)
        } else {
            match self.prompter.ask(prompt_text, default) {
                Ok(answer) if answer.trim().is_empty() => (default.to_string(), Provenance::Prompt),
                Ok(answer) => (answer.trim().to_string(), Provenance::Prompt),
                Err(e) => {
                    tracing::warn!("Prompt for {key} failed ({e}), using default");
                    (default.to_string(), Provenance::Default)
                }
            }
        };

        tracing::info!(key, value = %value, source = %source, "Resolved config value");

        let resolved = ConfigValue {
            key: key.to_string(),
            value,
            source,
        };
        self.cache.insert(key.to_string(), resolved.clone());
        resolved
    }

    /// Resolve a yes/no answer.
    pub fn resolve_bool(&mut self, key: &str, default: bool, prompt_text: &str) -> bool {
        let default_str = if default { "yes" } else { "no" };
        let resolved = self.resolve(key, default_str, &format!("{prompt_text} (yes/no)"));
        parse_yes_no(&resolved.value).unwrap_or_else(|| {
            tracing::warn!(
                "{key}: '{}' is not yes/no, using {default_str}",
                resolved.value
            );
            default
        })
    }

    /// Resolve and parse a value, falling back to `default` if it does not parse.
    pub fn resolve_parsed<T>(&mut self, key: &str, default: T, prompt_text: &str) -> T
    where
        T: std::str::FromStr + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let resolved = self.resolve(key, &default.to_string(), prompt_text);
        match resolved.value.parse() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("{key}: invalid value '{}' ({e}), using {default}", resolved.value);
                default
            }
        }
    }

    /// Resolve one of `choices` (case-insensitive). Unknown answers yield `default`.
    pub fn resolve_choice(
        &mut self,
        key: &str,
        choices: &[&str],
        default: &str,
        prompt_text: &str,
    ) -> String {
        let prompt = format!("{prompt_text} ({})", choices.join("/"));
        let resolved = self.resolve(key, default, &prompt);
        let answer = resolved.value.to_lowercase();
        if choices.iter().any(|c| *c == answer) {
            answer
        } else {
            tracing::warn!("{key}: '{}' is not one of {choices:?}, using {default}", resolved.value);
            default.to_string()
        }
    }
}
