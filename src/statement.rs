//! # SQL 语句切分
//!
//! 将转储文本切分为离散语句。边界判定基于一个最小化的词法状态机，
//! 而不是对分隔符的盲目扫描：跟踪单引号字符串（`''` 双写转义）、
//! 双引号标识符、`--` 行注释与 `/* */` 块注释，确保转义字符串内部
//! 的 `;` 不会被误认为语句边界。
//!
//! 纯注释/空白的片段会被丢弃，不产生语句。

/// 一条切分出的语句
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 语句文本（不含结尾 `;`，注释已剥离）
    pub text: String,
    /// 语句首个有效字符所在行（1 起始）
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
}

/// 切分转储文本为语句列表
pub fn split_statements(input: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut state = LexState::Normal;
    let mut current = String::new();
    let mut current_line: Option<usize> = None;
    let mut line = 1usize;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
        }
        match state {
            LexState::Normal => match c {
                ';' => {
                    let text = current.trim().to_string();
                    if !text.is_empty() {
                        statements.push(Statement {
                            text,
                            line: current_line.unwrap_or(line),
                        });
                    }
                    current.clear();
                    current_line = None;
                }
                '\'' => {
                    if current_line.is_none() {
                        current_line = Some(line);
                    }
                    state = LexState::SingleQuote;
                    current.push(c);
                }
                '"' => {
                    if current_line.is_none() {
                        current_line = Some(line);
                    }
                    state = LexState::DoubleQuote;
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = LexState::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = LexState::BlockComment;
                }
                _ => {
                    if !c.is_whitespace() && current_line.is_none() {
                        current_line = Some(line);
                    }
                    current.push(c);
                }
            },
            LexState::SingleQuote => {
                current.push(c);
                if c == '\'' {
                    // `''` 双写转义：消费第二个引号并留在字符串内
                    if chars.peek() == Some(&'\'') {
                        current.push('\'');
                        chars.next();
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::DoubleQuote => {
                current.push(c);
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        current.push('"');
                        chars.next();
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::LineComment => {
                if c == '\n' {
                    // 保留换行，避免多行语句被粘连
                    current.push('\n');
                    state = LexState::Normal;
                }
            }
            LexState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = LexState::Normal;
                }
            }
        }
    }

    // 文件末尾无 `;` 的残余内容
    let text = current.trim().to_string();
    if !text.is_empty() {
        statements.push(Statement {
            text,
            line: current_line.unwrap_or(line),
        });
    }

    statements
}

/// 从语句头部尽力提取目标表名，用于失败上下文
///
/// 识别 `INSERT INTO`、`CREATE TABLE`、`DROP TABLE`（含 `IF [NOT] EXISTS`）。
pub fn leading_table_name(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let mut words = lower.split_whitespace();
    let rest_offset;

    match (words.next()?, words.next()) {
        ("insert", Some("into")) => {
            rest_offset = find_after_keywords(&lower, &["insert", "into"])?;
        }
        ("create" | "drop", Some("table")) => {
            rest_offset = find_after_keywords(&lower, &["table"])?;
        }
        _ => return None,
    }

    let mut rest = sql[rest_offset..].trim_start();
    // 跳过 IF EXISTS / IF NOT EXISTS
    let lower_rest = rest.to_ascii_lowercase();
    for prefix in ["if not exists", "if exists"] {
        if lower_rest.starts_with(prefix) {
            rest = rest[prefix.len()..].trim_start();
            break;
        }
    }

    parse_ident(rest)
}

/// 返回最后一个关键字之后的字节偏移
fn find_after_keywords(lower: &str, keywords: &[&str]) -> Option<usize> {
    let mut pos = 0usize;
    for kw in keywords {
        let found = lower[pos..].find(kw)?;
        pos += found + kw.len();
    }
    Some(pos)
}

/// 解析一个（可能带引号的）标识符
fn parse_ident(input: &str) -> Option<String> {
    let input = input.trim_start();
    let mut chars = input.chars();
    match chars.next()? {
        '"' | '`' => {
            let quote = input.chars().next()?;
            let end = input[1..].find(quote)?;
            Some(input[1..1 + end].to_string())
        }
        _ => {
            let ident: String = input
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if ident.is_empty() {
                None
            } else {
                Some(ident)
            }
        }
    }
}
