//! Token 估算
//!
//! 上下文记录的大小按估算的 token 数计；摘要记录按预算截断。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 将文本截断到指定 token 数以内（保留开头）
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if TokenEstimator::estimate(text) <= max_tokens {
        return text.to_string();
    }
    const MARKER: &str = "...";
    let mut kept = String::new();
    let (mut ascii, mut non_ascii) = (0usize, 0usize);
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
        } else {
            non_ascii += 1;
        }
        // 与 estimate 相同的换算，+1 给截断标记
        let tokens = (ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize).max(1);
        if tokens + 1 > max_tokens {
            break;
        }
        kept.push(c);
    }
    format!("{}{}", kept.trim_end(), MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate() {
        assert_eq!(TokenEstimator::estimate(""), 1);
        assert_eq!(TokenEstimator::estimate("abcdefgh"), 2);
        assert_eq!(TokenEstimator::estimate("你好世"), 2);
    }

    #[test]
    fn test_truncate_fits_budget() {
        let text = "word ".repeat(200);
        let truncated = truncate_to_tokens(&text, 20);
        assert!(TokenEstimator::estimate(&truncated) <= 20);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_to_tokens("short", 20), "short");
    }
}
