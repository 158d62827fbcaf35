//! Prompt argument parser (§4.2, C4).
//!
//! Parses the free-text remainder of a triggered chat line into flags plus a
//! trailing prompt, the way the original implementation's
//! `ErrorCatchingArgumentParser` does: `--help` raises a distinct *Usage*
//! outcome (not an error), bad flags raise a distinct *ArgError*, and the
//! parser never terminates the process. Each backend configures a
//! [`PromptArgSpec`] naming which flags it recognizes; unioned across
//! backends this covers the flag set in §4.2 (model, sampler, steps, seed,
//! cfg-scale, temperature, followup, list-models, image URL).

use crate::error::ArgError;
use std::collections::HashSet;

/// Which flags a given backend accepts. Unset flags are rejected with
/// `ArgError::Invalid` if the user supplies them.
#[derive(Debug, Clone, Default)]
pub struct PromptArgSpec {
    pub model: bool,
    pub sampler: bool,
    pub steps: bool,
    pub seed: bool,
    pub cfg_scale: bool,
    pub temperature: bool,
    pub followup: bool,
    pub list_models: bool,
    pub imgurl: bool,
}

impl PromptArgSpec {
    pub fn image() -> Self {
        Self {
            model: true,
            list_models: true,
            imgurl: true,
            ..Default::default()
        }
    }

    pub fn llm() -> Self {
        Self {
            model: true,
            temperature: true,
            followup: true,
            list_models: true,
            ..Default::default()
        }
    }

    pub fn commands() -> Self {
        Self::default()
    }
}

/// Parsed prompt arguments. Fields the spec assigns to specific backends are
/// simply unused by backends that don't configure that flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptArgs {
    pub model: Option<String>,
    pub sampler: Option<String>,
    pub steps: Option<u32>,
    pub seed: Option<i64>,
    pub cfg_scale: Option<f32>,
    pub temperature: Option<f32>,
    pub followup: bool,
    pub list_models: bool,
    pub imgurl: Option<String>,
    /// Free-text remainder, rejoined with single spaces.
    pub prompt: String,
}

fn usage_text(prog: &str, spec: &PromptArgSpec) -> String {
    let mut lines = vec![format!("usage: {prog} [flags] <prompt>"), String::new(), "flags:".to_string()];
    lines.push("  -h, --help            show this help message".to_string());
    if spec.model {
        lines.push("  -m, --model MODEL     model to use".to_string());
    }
    if spec.sampler {
        lines.push("  --sampler SAMPLER     sampler to use".to_string());
    }
    if spec.steps {
        lines.push("  --steps N             number of sampling steps".to_string());
    }
    if spec.seed {
        lines.push("  --seed N              RNG seed".to_string());
    }
    if spec.cfg_scale {
        lines.push("  --cfg-scale N         classifier-free guidance scale".to_string());
    }
    if spec.temperature {
        lines.push("  --temperature N       sampling temperature".to_string());
    }
    if spec.followup {
        lines.push("  --followup            continue the previous conversation".to_string());
    }
    if spec.list_models {
        lines.push("  -l, --list-models     list available models".to_string());
    }
    if spec.imgurl {
        lines.push("  -i, --imgurl URL      start from an image at URL".to_string());
    }
    lines.join("\n")
}

fn parse_value<T: std::str::FromStr>(flag: &str, raw: Option<&str>) -> Result<T, ArgError> {
    let raw = raw.ok_or_else(|| ArgError::Invalid(format!("{flag} requires a value")))?;
    raw.parse::<T>()
        .map_err(|_| ArgError::Invalid(format!("{flag} has an invalid value: '{raw}'")))
}

/// Parse a prompt string into [`PromptArgs`] according to `spec`.
///
/// Raises [`ArgError::Usage`] when `--help`/`-h` is present anywhere in the
/// input (matching `ErrorCatchingArgumentParser.print_help`), and
/// [`ArgError::Invalid`] for any other parse failure. Never panics on
/// malformed input.
pub fn parse_prompt(prog: &str, prompt: &str, spec: &PromptArgSpec) -> Result<PromptArgs, ArgError> {
    let tokens: Vec<&str> = prompt.split_whitespace().collect();

    let mut args = PromptArgs::default();
    let mut remainder: Vec<&str> = Vec::new();
    let mut seen_flags: HashSet<&str> = HashSet::new();

    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i];
        match tok {
            "-h" | "--help" => {
                return Err(ArgError::Usage(usage_text(prog, spec)));
            }
            "-m" | "--model" if spec.model => {
                i += 1;
                args.model = Some(parse_value::<String>("--model", tokens.get(i).copied())?);
                seen_flags.insert("model");
            }
            "--sampler" if spec.sampler => {
                i += 1;
                args.sampler = Some(parse_value::<String>("--sampler", tokens.get(i).copied())?);
            }
            "--steps" if spec.steps => {
                i += 1;
                args.steps = Some(parse_value::<u32>("--steps", tokens.get(i).copied())?);
            }
            "--seed" if spec.seed => {
                i += 1;
                args.seed = Some(parse_value::<i64>("--seed", tokens.get(i).copied())?);
            }
            "--cfg-scale" if spec.cfg_scale => {
                i += 1;
                args.cfg_scale = Some(parse_value::<f32>("--cfg-scale", tokens.get(i).copied())?);
            }
            "--temperature" if spec.temperature => {
                i += 1;
                args.temperature = Some(parse_value::<f32>("--temperature", tokens.get(i).copied())?);
            }
            "--followup" if spec.followup => {
                args.followup = true;
            }
            "-l" | "--list-models" if spec.list_models => {
                args.list_models = true;
            }
            "-i" | "--imgurl" if spec.imgurl => {
                i += 1;
                args.imgurl = Some(parse_value::<String>("--imgurl", tokens.get(i).copied())?);
            }
            flag if flag.starts_with('-') && flag.len() > 1 && !flag.chars().nth(1).unwrap().is_numeric() => {
                return Err(ArgError::Invalid(format!("unrecognized argument: {flag}")));
            }
            other => remainder.push(other),
        }
        i += 1;
    }

    args.prompt = remainder.join(" ");
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prompt_has_no_flags() {
        let args = parse_prompt("!dream", "a cat in a hat", &PromptArgSpec::image()).unwrap();
        assert_eq!(args.prompt, "a cat in a hat");
        assert!(args.model.is_none());
    }

    #[test]
    fn model_flag_is_parsed_and_removed_from_prompt() {
        let args = parse_prompt("!dream", "--model sdxl a cat", &PromptArgSpec::image()).unwrap();
        assert_eq!(args.model.as_deref(), Some("sdxl"));
        assert_eq!(args.prompt, "a cat");
    }

    #[test]
    fn help_raises_usage_not_error() {
        let err = parse_prompt("!dream", "--help", &PromptArgSpec::image()).unwrap_err();
        assert!(matches!(err, ArgError::Usage(_)));
    }

    #[test]
    fn unknown_flag_raises_arg_error() {
        let err = parse_prompt("!dream", "--bogus x", &PromptArgSpec::image()).unwrap_err();
        assert!(matches!(err, ArgError::Invalid(_)));
    }

    #[test]
    fn flag_not_in_spec_is_rejected() {
        // --followup is an LLM-only flag; the image backend doesn't recognize it.
        let err = parse_prompt("!dream", "--followup hi", &PromptArgSpec::image()).unwrap_err();
        assert!(matches!(err, ArgError::Invalid(_)));
    }

    #[test]
    fn llm_followup_flag() {
        let args = parse_prompt("!gpt", "--followup tell me more", &PromptArgSpec::llm()).unwrap();
        assert!(args.followup);
        assert_eq!(args.prompt, "tell me more");
    }

    #[test]
    fn negative_numbers_in_prompt_are_not_mistaken_for_flags() {
        let args = parse_prompt("!dream", "a -1 score movie", &PromptArgSpec::image()).unwrap();
        assert_eq!(args.prompt, "a -1 score movie");
    }

    /// Testable property / scenario 8.e: "--help something" returns usage,
    /// not an error.
    #[test]
    fn help_anywhere_in_input_yields_usage() {
        let err = parse_prompt("!gpt", "--help something", &PromptArgSpec::llm()).unwrap_err();
        assert!(matches!(err, ArgError::Usage(_)));
    }
}
