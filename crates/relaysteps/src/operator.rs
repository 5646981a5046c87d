use async_trait::async_trait;
use regex::Regex;
use relaycore::{StepContext, StepError, StepExecutor, StepKind, StepResult, WorkflowStep};
use serde_json::json;
use std::str::FromStr;

const DEFAULT_SUMMARY_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Concat,
    Summarize,
    Extract,
    Classify,
    JsonParse,
}

impl FromStr for Operation {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "concat" => Ok(Operation::Concat),
            "summarize" => Ok(Operation::Summarize),
            "extract" => Ok(Operation::Extract),
            "classify" => Ok(Operation::Classify),
            "json_parse" | "json-parse" => Ok(Operation::JsonParse),
            other => Err(StepError::Configuration(format!(
                "Unknown operation '{}' (expected concat, summarize, extract, classify or json_parse)",
                other
            ))),
        }
    }
}

/// Deterministic transforms over upstream outputs
pub struct ScriptedOperatorExecutor;

impl ScriptedOperatorExecutor {
    /// Upstream outputs, or the step's own `input` when it has no dependencies.
    fn input_texts(step: &WorkflowStep, ctx: &StepContext) -> Vec<String> {
        if ctx.upstream.is_empty() {
            let input = step.config.get_str("input").unwrap_or(&step.task);
            vec![input.to_string()]
        } else {
            ctx.upstream.iter().map(|u| u.output.clone()).collect()
        }
    }
}

#[async_trait]
impl StepExecutor for ScriptedOperatorExecutor {
    fn kind(&self) -> StepKind {
        StepKind::ScriptedOperator
    }

    fn description(&self) -> &str {
        "Named transform on upstream outputs: concat, summarize, extract, classify, json_parse"
    }

    async fn execute(&self, step: &WorkflowStep, ctx: StepContext) -> Result<StepResult, StepError> {
        let operation: Operation = step.config.get_str("operation").unwrap_or("concat").parse()?;
        let inputs = Self::input_texts(step, &ctx);

        ctx.events.info(format!("Applying {:?} to {} input(s)", operation, inputs.len()));

        match operation {
            Operation::Concat => {
                let separator = step.config.get_str("separator").unwrap_or("\n\n");
                Ok(ctx.completed(inputs.join(separator)))
            }
            Operation::Summarize => {
                let max_chars = step
                    .config
                    .get_u64("max_chars")
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_SUMMARY_CHARS);
                Ok(ctx.completed(summarize(&inputs.join(" "), max_chars)))
            }
            Operation::Extract => {
                let pattern = step.config.require_str("pattern")?;
                let regex = Regex::new(pattern)
                    .map_err(|e| StepError::Configuration(format!("Invalid pattern: {}", e)))?;
                let matches = extract(&regex, &inputs);
                if matches.is_empty() {
                    return Err(StepError::ExecutionFailed(format!(
                        "Pattern '{}' matched nothing",
                        pattern
                    )));
                }
                Ok(ctx.completed(matches.join("\n")).with_structured(json!(matches)))
            }
            Operation::Classify => {
                let labels = step.config.get_str_list("labels");
                if labels.is_empty() {
                    return Err(StepError::Configuration("Missing config: labels".to_string()));
                }
                let text = inputs.join("\n");
                let (label, scores) = classify(&text, &labels);
                let label = label
                    .or_else(|| step.config.get_str("default").map(str::to_string))
                    .unwrap_or_else(|| "unclassified".to_string());
                Ok(ctx
                    .completed(label.clone())
                    .with_structured(json!({ "label": label, "scores": scores })))
            }
            Operation::JsonParse => {
                let text = inputs.join("\n");
                let parsed: serde_json::Value = serde_json::from_str(text.trim())
                    .map_err(|e| StepError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
                Ok(ctx.completed(parsed.to_string()).with_structured(parsed))
            }
        }
    }
}

/// Collapse whitespace and cut at a word boundary within `max_chars`.
fn summarize(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }

    let budget = max_chars.saturating_sub(3);
    let cut = collapsed
        .char_indices()
        .nth(budget)
        .map(|(i, _)| i)
        .unwrap_or(collapsed.len());
    let head = &collapsed[..cut];
    let head = match head.rfind(' ') {
        Some(space) if space > 0 => &head[..space],
        _ => head,
    };
    format!("{}...", head.trim_end())
}

/// First capture group of every match when the pattern has one, otherwise
/// the whole match.
fn extract(regex: &Regex, inputs: &[String]) -> Vec<String> {
    let mut matches = Vec::new();
    for input in inputs {
        for caps in regex.captures_iter(input) {
            let m = caps.get(1).or_else(|| caps.get(0));
            if let Some(m) = m {
                matches.push(m.as_str().to_string());
            }
        }
    }
    matches
}

/// Pick the label mentioned most often; ties go to the earlier label.
fn classify(text: &str, labels: &[String]) -> (Option<String>, serde_json::Map<String, serde_json::Value>) {
    let haystack = text.to_lowercase();
    let mut scores = serde_json::Map::new();
    let mut best: Option<(&String, usize)> = None;

    for label in labels {
        let count = haystack.matches(&label.to_lowercase()).count();
        scores.insert(label.clone(), json!(count));
        if count > 0 && best.map_or(true, |(_, top)| count > top) {
            best = Some((label, count));
        }
    }

    (best.map(|(label, _)| label.clone()), scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_keeps_short_text() {
        assert_eq!(summarize("  hello \n world ", 50), "hello world");
    }

    #[test]
    fn summarize_cuts_at_word_boundary() {
        let summary = summarize("the quick brown fox jumps over the lazy dog", 20);
        assert_eq!(summary, "the quick brown...");
        assert!(summary.chars().count() <= 20);
    }

    #[test]
    fn summarize_handles_multibyte_text() {
        let summary = summarize("ééééé ééééé ééééé", 10);
        assert_eq!(summary, "ééééé...");
    }

    #[test]
    fn classify_prefers_first_label_on_tie() {
        let labels = vec!["bug".to_string(), "feature".to_string()];
        let (label, scores) = classify("A bug report asking for a feature", &labels);
        assert_eq!(label.as_deref(), Some("bug"));
        assert_eq!(scores["feature"], json!(1));
    }

    #[test]
    fn operation_names_parse() {
        assert_eq!("json-parse".parse::<Operation>().unwrap(), Operation::JsonParse);
        assert!("shout".parse::<Operation>().is_err());
    }
}
