use crate::error::SyncError;
use crate::storage::{is_reserved_name, Entry};
use regex::Regex;

/// 默认排除规则（常见的版本控制和系统文件）
pub const DEFAULT_EXCLUDES: &str = ".DS_Store,.git,.hg,.svn,#recycle,Thumbs.db";

/// 条目过滤器
///
/// 规则是逗号分隔的 shell 通配符。包含规则只作用于文件，目录总是会被遍历；
/// 排除规则匹配名称或相对路径，并且优先于包含规则。
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl EntryFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, SyncError> {
        Ok(Self {
            include: Self::compile(include)?,
            exclude: Self::compile(exclude)?,
        })
    }

    fn compile(patterns: Option<&str>) -> Result<Vec<Regex>, SyncError> {
        patterns
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                Regex::new(&wildcard_to_regex(p)).map_err(|source| SyncError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect()
    }

    /// 条目是否参与同步
    pub fn accepts(&self, entry: &Entry) -> bool {
        let name = entry.name();
        if is_reserved_name(name) {
            return false;
        }

        if !entry.is_dir()
            && !self.include.is_empty()
            && !self.include.iter().any(|re| re.is_match(name))
        {
            return false;
        }

        let path = entry.rel_path();
        !self
            .exclude
            .iter()
            .any(|re| re.is_match(name) || re.is_match(path))
    }
}

/// 把 shell 通配符（`*`、`?`、`[...]`、`[!...]`）转换为锚定的正则
fn wildcard_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::with_capacity(pattern.len() * 2 + 8);
    // 大小写规则跟随宿主文件系统
    if cfg!(any(windows, target_os = "macos")) {
        re.push_str("(?i)");
    }
    re.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    let mut body = &chars[i + 1..end];
                    re.push('[');
                    if body.first() == Some(&'!') {
                        re.push('^');
                        body = &body[1..];
                    }
                    for &c in body {
                        if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
                            re.push('\\');
                        }
                        re.push(c);
                    }
                    re.push(']');
                    i = end;
                }
                // 没有闭合的 ] 时按字面处理
                None => re.push_str("\\["),
            },
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
        i += 1;
    }

    re.push('$');
    re
}

/// 字符类的闭合位置；紧跟在 `[` 或 `[!` 之后的 `]` 属于字符类本身
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    if j >= chars.len() {
        return None;
    }
    chars[j..].iter().position(|&c| c == ']').map(|p| p + j)
}
