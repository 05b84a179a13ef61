//! Token usage and completion metadata.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Token usage for a generation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Merge another usage into this one (accumulate).
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_rounds() {
        let mut total = Usage::default();
        total.merge(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        total.merge(&Usage {
            input_tokens: 20,
            output_tokens: 1,
            total_tokens: 21,
        });
        assert_eq!(total.total_tokens, 36);
        assert_eq!(total.input_tokens, 30);
    }
}
