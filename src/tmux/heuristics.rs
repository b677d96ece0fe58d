use once_cell::sync::Lazy;
use regex::Regex;

/// Compiled regex patterns for AI session detection
static RE_AI_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(claude|\bai\b|agent|llm|gpt|anthropic|openai|copilot|cursor|codex|gemini|aider)")
        .unwrap()
});

/// Known agents, checked in order; the first match names the agent
static AGENT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("codex", Regex::new(r"(?i)codex").unwrap()),
        ("claude", Regex::new(r"(?i)claude").unwrap()),
        ("gemini", Regex::new(r"(?i)gemini").unwrap()),
        ("aider", Regex::new(r"(?i)aider").unwrap()),
    ]
});

/// Classifies sessions as AI-driven from their pane commands and name
pub struct AgentDetector;

impl AgentDetector {
    /// Returns `(is_ai_session, agent)`.
    ///
    /// Pane commands win over the session name, since a renamed session
    /// still runs the same process.
    pub fn detect<'a>(
        session_name: &str,
        pane_commands: impl IntoIterator<Item = &'a str>,
    ) -> (bool, Option<String>) {
        for command in pane_commands {
            if let Some(agent) = Self::match_agent(command) {
                return (true, Some(agent));
            }
            if RE_AI_KEYWORD.is_match(command) {
                return (true, None);
            }
        }

        if let Some(agent) = Self::match_agent(session_name) {
            return (true, Some(agent));
        }
        (RE_AI_KEYWORD.is_match(session_name), None)
    }

    fn match_agent(value: &str) -> Option<String> {
        AGENT_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(value))
            .map(|(agent, _)| agent.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_agent_from_pane_command() {
        let (is_ai, agent) = AgentDetector::detect("work", ["zsh", "codex"]);
        assert!(is_ai);
        assert_eq!(agent.as_deref(), Some("codex"));
    }

    #[test]
    fn test_detect_keyword_without_agent() {
        let (is_ai, agent) = AgentDetector::detect("llm-playground", Vec::<&str>::new());
        assert!(is_ai);
        assert_eq!(agent, None);
    }

    #[test]
    fn test_detect_from_session_name() {
        let (is_ai, agent) = AgentDetector::detect("headless-claude-api-20260101", ["sh"]);
        assert!(is_ai);
        assert_eq!(agent.as_deref(), Some("claude"));
    }

    #[test]
    fn test_plain_session_is_not_ai() {
        let (is_ai, agent) = AgentDetector::detect("main", ["vim", "bash"]);
        assert!(!is_ai);
        assert_eq!(agent, None);
    }
}
