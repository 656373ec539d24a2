//! Character-based token estimation. No tokenizer dependency: counts are
//! heuristic, biased slightly high so budget math stays on the safe side.

use crate::types::Message;

/// Average characters per token for Latin-ish text.
const CHARS_PER_TOKEN: f64 = 4.0;

/// CJK scripts tokenize much denser than Latin text.
const CJK_CHARS_PER_TOKEN: f64 = 1.5;

/// Framing overhead per message (role tag, separators).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// True for characters in the common CJK blocks, including kana, hangul,
/// CJK punctuation and fullwidth forms.
pub(crate) fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F   // CJK punctuation
        | 0x3040..=0x30FF // hiragana, katakana
        | 0x3400..=0x4DBF // CJK extension A
        | 0x4E00..=0x9FFF // CJK unified ideographs
        | 0xAC00..=0xD7AF // hangul syllables
        | 0xFF00..=0xFFEF // fullwidth forms
    )
}

/// Estimate tokens for a text fragment.
pub fn estimate_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let mut cjk = 0u64;
    let mut other = 0u64;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (other as f64 / CHARS_PER_TOKEN + cjk as f64 / CJK_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate tokens for one message, framing overhead included.
pub fn estimate_message(message: &Message) -> u32 {
    estimate_text(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate tokens for a whole conversation.
pub fn estimate_messages(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_zero() {
        assert_eq!(estimate_text(""), 0);
    }

    #[test]
    fn test_ascii_estimation() {
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
        assert_eq!(estimate_text(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_cjk_is_denser_than_ascii() {
        // Same character count, more tokens.
        assert_eq!(estimate_text("ab"), 1);
        assert_eq!(estimate_text("你好"), 2);
        assert!(estimate_text(&"語".repeat(30)) > estimate_text(&"x".repeat(30)));
    }

    #[test]
    fn test_mixed_script_estimation() {
        // "hi " is 3 Latin chars (0.75), two ideographs add 1.33; ceil = 3.
        assert_eq!(estimate_text("hi 你好"), 3);
    }

    #[test]
    fn test_is_cjk_ranges() {
        for c in ['你', 'あ', 'ア', '한', '。', 'Ａ'] {
            assert!(is_cjk(c), "{c} should count as CJK");
        }
        for c in ['a', 'Z', '0', ' ', 'é', 'ß'] {
            assert!(!is_cjk(c), "{c} should not count as CJK");
        }
    }

    #[test]
    fn test_message_overhead() {
        let msg = Message::user("abcd");
        assert_eq!(estimate_message(&msg), 1 + MESSAGE_OVERHEAD_TOKENS);

        let empty = Message::user("");
        assert_eq!(estimate_message(&empty), MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_conversation_sum() {
        let messages = vec![Message::system("abcd"), Message::user("abcd")];
        assert_eq!(estimate_messages(&messages), 2 * (1 + MESSAGE_OVERHEAD_TOKENS));
    }
}
