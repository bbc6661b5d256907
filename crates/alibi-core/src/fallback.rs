//! Scripted replies for suspects with no agent attached

use rand::seq::SliceRandom;

/// Lines used when no pool is configured
pub const DEFAULT_REPLIES: &[&str] = &[
    "This is a dummy reply from suspect.",
    "I have an alibi.",
    "You must be mistaken.",
    "I was at the bar that night.",
    "I didn't see anything.",
];

/// Produces a suspect's reply without an agent. Must be infallible, must not
/// block, and must never return an empty string.
pub trait FallbackResponder: Send + Sync {
    fn reply(&self, suspect_id: &str, participant_message: &str) -> String;
}

/// Picks uniformly from a fixed pool of lines
#[derive(Debug, Clone)]
pub struct ScriptedResponder {
    replies: Vec<String>,
}

impl ScriptedResponder {
    /// Build from a configured pool. Blank lines are discarded; an empty
    /// pool falls back to `DEFAULT_REPLIES`.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies
            .into_iter()
            .map(Into::into)
            .filter(|r| !r.trim().is_empty())
            .collect();
        if replies.is_empty() {
            return Self::default();
        }
        Self { replies }
    }

    pub fn replies(&self) -> &[String] {
        &self.replies
    }
}

impl Default for ScriptedResponder {
    fn default() -> Self {
        Self {
            replies: DEFAULT_REPLIES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl FallbackResponder for ScriptedResponder {
    fn reply(&self, _suspect_id: &str, _participant_message: &str) -> String {
        self.replies
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_REPLIES[0].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool() {
        let responder = ScriptedResponder::default();
        assert_eq!(responder.replies().len(), 5);
        for _ in 0..50 {
            let reply = responder.reply("suspectA", "Hello");
            assert!(!reply.is_empty());
            assert!(DEFAULT_REPLIES.contains(&reply.as_str()));
        }
    }

    #[test]
    fn test_custom_pool_drops_blank_lines() {
        let responder = ScriptedResponder::new(["  ", "No comment.", ""]);
        assert_eq!(responder.replies(), ["No comment.".to_string()]);
        assert_eq!(responder.reply("suspectB", "Why?"), "No comment.");
    }

    #[test]
    fn test_empty_pool_uses_defaults() {
        let responder = ScriptedResponder::new(Vec::<String>::new());
        assert_eq!(responder.replies().len(), DEFAULT_REPLIES.len());
    }
}
