//! 命令解析与菜单
//!
//! 输入形如 `/ingest <path>`、`/ask <question>`、`/stats`、`/quit`；前导 `/` 可省略，命令词不区分大小写。
//! 解析是纯函数，重放事件日志时对同一输入总能得到同一结果。

use serde::{Deserialize, Serialize};

use crate::core::CommandParseError;

pub const MENU: &str = "\nCommands:\n  /ingest <path-to-document>  ingest a document into the index\n  /ask <question>             query the indexed documents\n  /stats                      show vector index statistics\n  /quit                       quit the session\n";

const INGEST_USAGE: &str = "/ingest <path-to-document>";
const ASK_USAGE: &str = "/ask <question>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Ingest,
    Ask,
    Stats,
    Quit,
    Unknown,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Ingest => "ingest",
            CommandKind::Ask => "ask",
            CommandKind::Stats => "stats",
            CommandKind::Quit => "quit",
            CommandKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: CommandKind,
    pub arguments: Vec<String>,
}

impl CommandRequest {
    fn new(command: CommandKind, arguments: Vec<String>) -> Self {
        Self { command, arguments }
    }

    /// 第一个参数（ingest 的路径、ask 的问题、unknown 的命令词）
    pub fn first_argument(&self) -> &str {
        self.arguments.first().map(String::as_str).unwrap_or("")
    }
}

/// 当前菜单文本
pub fn render_menu() -> String {
    MENU.to_string()
}

/// 将原始输入解析为命令；空输入返回 Empty，调用方应改为刷新菜单
pub fn parse_command(raw: &str) -> Result<CommandRequest, CommandParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CommandParseError::Empty);
    }

    let (word, rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim()),
        None => (trimmed, ""),
    };
    let word = word.strip_prefix('/').unwrap_or(word).to_lowercase();

    match word.as_str() {
        "ingest" => {
            let args = split_arguments(rest)?;
            match args.as_slice() {
                [path] => Ok(CommandRequest::new(CommandKind::Ingest, vec![path.clone()])),
                _ => Err(CommandParseError::Usage(INGEST_USAGE)),
            }
        }
        // 问题原样保留，撇号等不作为引号处理
        "ask" => {
            if rest.is_empty() {
                Err(CommandParseError::Usage(ASK_USAGE))
            } else {
                Ok(CommandRequest::new(CommandKind::Ask, vec![rest.to_string()]))
            }
        }
        "stats" | "stat" => Ok(CommandRequest::new(CommandKind::Stats, Vec::new())),
        "quit" | "exit" => Ok(CommandRequest::new(CommandKind::Quit, Vec::new())),
        _ => {
            let mut args = vec![word];
            args.extend(split_arguments(rest).unwrap_or_else(|_| vec![rest.to_string()]));
            args.retain(|a| !a.is_empty());
            Ok(CommandRequest::new(CommandKind::Unknown, args))
        }
    }
}

/// 输入是否为 quit（用于在等待子执行时优先处理）
pub fn is_quit(raw: &str) -> bool {
    matches!(parse_command(raw), Ok(CommandRequest { command: CommandKind::Quit, .. }))
}

/// 按空白切分，支持单/双引号与反斜杠转义
fn split_arguments(input: &str) -> Result<Vec<String>, CommandParseError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(CommandParseError::UnbalancedQuotes(input.to_string()));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}
