/// Append-only buffers for the two text channels of a reply.
#[derive(Debug, Default, Clone)]
pub struct MessageAssembler {
    content: String,
    reasoning: String,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for an empty delta, which leaves the buffer untouched.
    pub fn push_content(&mut self, delta: &str) -> bool {
        if delta.is_empty() {
            return false;
        }
        self.content.push_str(delta);
        true
    }

    pub fn push_reasoning(&mut self, delta: &str) -> bool {
        if delta.is_empty() {
            return false;
        }
        self.reasoning.push_str(delta);
        true
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty()
    }

    pub fn into_parts(self) -> (String, String) {
        (self.content, self.reasoning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_concatenate_in_order() {
        let mut asm = MessageAssembler::new();
        for delta in ["SELECT", " *", "", " FROM", " sales"] {
            asm.push_content(delta);
        }
        assert_eq!(asm.content(), "SELECT * FROM sales");
        assert!(asm.reasoning().is_empty());
    }

    #[test]
    fn test_empty_delta_is_noop() {
        let mut asm = MessageAssembler::new();
        assert!(!asm.push_reasoning(""));
        assert!(!asm.push_content(""));
        assert!(asm.is_empty());

        assert!(asm.push_reasoning("思考"));
        assert!(!asm.is_empty());
        let (content, reasoning) = asm.into_parts();
        assert_eq!(content, "");
        assert_eq!(reasoning, "思考");
    }

    #[test]
    fn test_repeated_deltas_are_not_deduplicated() {
        let mut asm = MessageAssembler::new();
        asm.push_content("ha");
        asm.push_content("ha");
        assert_eq!(asm.content(), "haha");
    }
}
