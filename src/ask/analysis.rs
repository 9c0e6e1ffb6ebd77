//! 问题分析与多查询结果整理
//!
//! 复合问题按句末标点拆成子问题，每个子问题单独检索；一轮中取回的结果按来源限额重排，
//! 避免单个文档占满上下文。

use std::collections::HashMap;

use crate::index::RetrievedChunk;

fn is_terminator(c: char) -> bool {
    matches!(c, '?' | '!' | '.' | '？' | '！' | '。')
}

fn is_cjk_terminator(c: char) -> bool {
    matches!(c, '？' | '！' | '。')
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 拆分子问题，最多 `max` 个；每个子问题以问号结尾。句中的小数点、缩写不拆。
pub fn split_subquestions(question: &str, max: usize) -> Vec<String> {
    let question = normalize(question);
    if question.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = question.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        current.push(c);
        let at_boundary = chars.get(i + 1).map_or(true, |next| next.is_whitespace());
        if is_terminator(c) && (at_boundary || is_cjk_terminator(c)) {
            segments.push(std::mem::take(&mut current));
        }
    }
    segments.push(current);

    let mut out: Vec<String> = Vec::new();
    for segment in segments {
        let body = segment.trim().trim_end_matches(is_terminator).trim();
        if body.is_empty() {
            continue;
        }
        let sub = format!("{body}?");
        if !out.contains(&sub) {
            out.push(sub);
        }
        if out.len() >= max.max(1) {
            break;
        }
    }
    if out.is_empty() {
        out.push(question);
    }
    out
}

/// 反思之后的查询：原问题加改写结果
pub fn followup_queries(original: &str, rewritten: &str) -> Vec<String> {
    let mut queries = vec![original.to_string()];
    if rewritten != original && !rewritten.is_empty() {
        queries.push(rewritten.to_string());
    }
    queries
}

/// 按分数降序；每个来源前 `max_per_source` 个排在前面，超出的按原顺序接在后面
pub fn rerank_by_source(mut chunks: Vec<RetrievedChunk>, max_per_source: usize) -> Vec<RetrievedChunk> {
    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    if max_per_source == 0 {
        return chunks;
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    let (mut primary, mut overflow) = (Vec::new(), Vec::new());
    for chunk in chunks {
        let seen = counts.entry(chunk.source.clone()).or_default();
        if *seen < max_per_source {
            *seen += 1;
            primary.push(chunk);
        } else {
            overflow.push(chunk);
        }
    }
    primary.extend(overflow);
    primary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChunkRef;

    fn hit(source: &str, id: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk: ChunkRef::new(source, id),
            ordinal: 0,
            source: source.to_string(),
            text: String::new(),
            score,
        }
    }

    #[test]
    fn test_single_question_is_kept() {
        assert_eq!(
            split_subquestions("  What is the   refund window?", 3),
            vec!["What is the refund window?"]
        );
        assert_eq!(split_subquestions("refund window", 3), vec!["refund window?"]);
        assert!(split_subquestions("   ", 3).is_empty());
    }

    #[test]
    fn test_composite_question_is_split_and_capped() {
        let subs = split_subquestions(
            "What is the refund window? How long does shipping take. Who pays returns! Extra part?",
            3,
        );
        assert_eq!(
            subs,
            vec![
                "What is the refund window?",
                "How long does shipping take?",
                "Who pays returns?"
            ]
        );
    }

    #[test]
    fn test_decimal_point_does_not_split() {
        assert_eq!(
            split_subquestions("Is version 2.5 supported?", 3),
            vec!["Is version 2.5 supported?"]
        );
        assert_eq!(split_subquestions("退款期限多久？运费谁付？", 3), vec!["退款期限多久?", "运费谁付?"]);
    }

    #[test]
    fn test_followups_include_original() {
        assert_eq!(
            followup_queries("refund window?", "refund policy days"),
            vec!["refund window?", "refund policy days"]
        );
        assert_eq!(followup_queries("q?", "q?"), vec!["q?"]);
    }

    #[test]
    fn test_rerank_caps_each_source() {
        let ranked = rerank_by_source(
            vec![
                hit("a.md", "a1", 0.9),
                hit("a.md", "a2", 0.8),
                hit("a.md", "a3", 0.7),
                hit("b.md", "b1", 0.5),
            ],
            2,
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1", "a3"]);
    }
}
