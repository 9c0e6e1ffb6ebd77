//! 分词模块
//!
//! 中英文混合分词，用于关键词检索与相关性判定。
//! 含 CJK 字符的片段交给 jieba-rs（搜索引擎模式），其余按非字母数字字符切分并转小写。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 英文停用词（疑问词、冠词、助动词等，不参与相关性判定）
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "in", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when",
    "where", "which", "who", "why", "will", "with", "you", "your", "our", "we", "i", "me", "my",
    "about", "there", "their", "they", "them", "these", "those", "into", "any", "all", "has",
    "have", "had", "not", "no", "if", "so", "than", "then", "also", "may", "should", "would",
    "could", "tell", "please", "的", "了", "是", "在", "和", "吗", "呢", "什么", "怎么", "如何",
];

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 智能分词：包含 CJK 字符时使用 jieba，否则按非字母数字切分
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| {
                s.chars().any(is_cjk) || (s.chars().count() > 1 && s.chars().any(char::is_alphanumeric))
            })
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|s| {
                s.chars().count() > 1 || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            })
            .collect()
    }
}

pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(&term)
}

/// 去掉停用词后的词集合（相关性判定用）
pub fn content_terms(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect()
}

/// 计算两个词集合的重叠分数（交集大小）
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}

/// 关键词得分：命中的查询词按长度加权，归一化到 [0, 1]
pub fn keyword_score(query_terms: &HashSet<String>, doc_terms: &HashSet<String>) -> f32 {
    if query_terms.is_empty() || doc_terms.is_empty() {
        return 0.0;
    }
    let weight = |t: &String| (t.chars().count() as f32).sqrt();
    let total: f32 = query_terms.iter().map(weight).sum();
    let hit: f32 = query_terms.intersection(doc_terms).map(weight).sum();
    if total > 0.0 {
        hit / total
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("人工") || t.contains("智能")));
    }

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("What is the refund window?");
        assert!(tokens.contains(&"refund".to_string()));
        assert!(tokens.contains(&"window".to_string()));
        assert!(!tokens.iter().any(|t| t.contains('?')));
    }

    #[test]
    fn test_numbers_survive() {
        let tokens = tokenize("within 30 days, or 7");
        assert!(tokens.contains(&"30".to_string()));
        assert!(tokens.contains(&"7".to_string()));
    }

    #[test]
    fn test_content_terms_drop_stopwords() {
        let terms = content_terms("What is the refund window?");
        assert_eq!(terms.len(), 2);
        assert!(terms.contains("refund"));
    }

    #[test]
    fn test_mixed_text() {
        let tokens = tokenize("我喜欢 Rust 编程语言");
        assert!(tokens.iter().any(|t| t == "rust" || t.contains("编程")));
    }

    #[test]
    fn test_keyword_score_bounds() {
        let q = content_terms("refund window");
        let full = content_terms("The refund window is 30 days");
        let none = content_terms("Shipping takes a week");
        assert!((keyword_score(&q, &full) - 1.0).abs() < 1e-6);
        assert_eq!(keyword_score(&q, &none), 0.0);
        assert_eq!(overlap_score(&q, &full), 2);
    }
}
