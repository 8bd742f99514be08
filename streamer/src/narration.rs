//! Narration collaborators backed by external commands.
//!
//! Both adapters take a command template from the config file, split it with
//! shell quoting rules and substitute `{placeholders}` per argument, so paths
//! and topics containing spaces stay a single argument.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use livecast_common::config::ConfigError;
use tokio::process::Command;
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::scheduler::{NarrationProvider, SpeechSynthesizer};

/// A command template split into program and argument words.
#[derive(Debug, Clone)]
struct CommandTemplate {
    words: Vec<String>,
}

impl CommandTemplate {
    fn parse(template: &str) -> StreamResult<Self> {
        let invalid = |reason: String| StreamError::Configuration(ConfigError::Invalid(reason));
        let words = shell_words::split(template)
            .map_err(|e| invalid(format!("bad command template {template:?}: {e}")))?;
        if words.is_empty() {
            return Err(invalid("empty command template".into()));
        }
        Ok(Self { words })
    }

    fn render(&self, substitutions: &[(&str, &str)]) -> (String, Vec<String>) {
        let mut words = self.words.iter().map(|word| {
            substitutions
                .iter()
                .fold(word.clone(), |acc, (key, value)| acc.replace(key, value))
        });
        // parse() guarantees at least one word
        let program = words.next().unwrap_or_default();
        (program, words.collect())
    }
}

async fn run_command(program: &str, args: &[String]) -> StreamResult<String> {
    debug!(program, ?args, "running narration command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StreamError::Generation(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StreamError::Generation(format!(
            "{program} exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Generates narration text by running `generate_command`; `{topic}` is
/// replaced with the configured topic and stdout is the narration.
pub struct CommandNarrator {
    template: CommandTemplate,
}

impl CommandNarrator {
    pub fn new(template: &str) -> StreamResult<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
        })
    }
}

#[async_trait]
impl NarrationProvider for CommandNarrator {
    async fn generate(&self, topic: &str) -> StreamResult<String> {
        let (program, args) = self.template.render(&[("{topic}", topic)]);
        let text = run_command(&program, &args).await?;
        if text.is_empty() {
            return Err(StreamError::Generation(format!("{program} produced no narration")));
        }
        Ok(text)
    }
}

/// Synthesizes speech by running `synthesize_command` with `{text_file}` and
/// `{output}` substitutions.
pub struct CommandSynthesizer {
    template: CommandTemplate,
}

impl CommandSynthesizer {
    pub fn new(template: &str) -> StreamResult<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    async fn synthesize(&self, text: &str, output: &Path) -> StreamResult<PathBuf> {
        let text_file = output.with_extension("txt");
        tokio::fs::write(&text_file, text).await?;

        let text_arg = text_file.to_string_lossy().into_owned();
        let output_arg = output.to_string_lossy().into_owned();
        let (program, args) = self
            .template
            .render(&[("{text_file}", &text_arg), ("{output}", &output_arg)]);
        let result = run_command(&program, &args).await;

        if let Err(e) = tokio::fs::remove_file(&text_file).await {
            debug!(path = %text_file.display(), error = %e, "could not remove narration text");
        }
        result?;

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(StreamError::Generation(format!(
                "{program} did not write {}",
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}
