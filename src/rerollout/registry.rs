//! Original → regenerated tool-call id mapping for one record.

use crate::models::ToolCall;
use std::collections::HashMap;

/// Maps original tool-call ids to the ids the replacement model generated.
///
/// Lives for exactly one record's regeneration pass.
#[derive(Debug, Default)]
pub struct ToolCallRegistry {
    ids: HashMap<String, String>,
}

impl ToolCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair original and new calls by position.
    ///
    /// Extra calls on either side are left unmapped, as are empty ids.
    pub fn register(&mut self, original: &[ToolCall], regenerated: &[ToolCall]) {
        for (orig, new) in original.iter().zip(regenerated) {
            if !orig.id.is_empty() && !new.id.is_empty() {
                self.ids.insert(orig.id.clone(), new.id.clone());
            }
        }
    }

    pub fn get(&self, original_id: &str) -> Option<&str> {
        self.ids.get(original_id).map(String::as_str)
    }

    /// Id a tool message answering `original_id` must carry, given the calls
    /// of the assistant message it follows.
    ///
    /// A mapping that points outside `turn_calls` (left over from an earlier
    /// turn) is ignored in favor of the turn's first call.
    pub fn resolve<'a>(&'a self, original_id: &str, turn_calls: &'a [ToolCall]) -> Option<&'a str> {
        self.get(original_id)
            .filter(|mapped| turn_calls.iter().any(|tc| tc.id == *mapped))
            .or_else(|| turn_calls.first().map(|tc| tc.id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "get_weather", "{}")
    }

    #[test]
    fn test_register_by_position() {
        let mut registry = ToolCallRegistry::new();
        registry.register(&[call("A1"), call("A2")], &[call("B1"), call("B2")]);
        assert_eq!(registry.get("A1"), Some("B1"));
        assert_eq!(registry.get("A2"), Some("B2"));
        assert_eq!(registry.get("B1"), None);
    }

    #[test]
    fn test_extra_original_calls_fall_back_to_first() {
        let mut registry = ToolCallRegistry::new();
        let turn = [call("B1")];
        registry.register(&[call("A1"), call("A2")], &turn);

        assert_eq!(registry.resolve("A1", &turn), Some("B1"));
        assert_eq!(registry.get("A2"), None);
        assert_eq!(registry.resolve("A2", &turn), Some("B1"));
    }

    #[test]
    fn test_empty_ids_are_not_registered() {
        let mut registry = ToolCallRegistry::new();
        registry.register(&[call("")], &[call("B1")]);
        registry.register(&[call("A1")], &[call("")]);
        assert_eq!(registry.get(""), None);
        assert_eq!(registry.get("A1"), None);
    }

    #[test]
    fn test_stale_mapping_is_not_reused_across_turns() {
        let mut registry = ToolCallRegistry::new();
        registry.register(&[call("A1")], &[call("B1")]);

        let second_turn = [call("C1")];
        registry.register(&[call("A2")], &second_turn);

        assert_eq!(registry.resolve("A1", &second_turn), Some("C1"));
        assert_eq!(registry.resolve("A2", &second_turn), Some("C1"));
    }

    #[test]
    fn test_resolve_without_calls() {
        let registry = ToolCallRegistry::new();
        assert_eq!(registry.resolve("A1", &[]), None);
    }
}
