use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// 命名模板中的一段
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// 字面量
    Static(String),
    /// 结构分区键：`<name>`
    Key(String),
    /// 代际变量：`{none|number|timestamp}`
    Var(String),
}

impl Segment {
    fn is_static(&self) -> bool {
        matches!(self, Segment::Static(_))
    }
}

/// 变量语义
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    /// 占位，值被忽略
    None,
    /// 代际号，例如 `000001`
    Number,
    /// 毫秒时间戳（日切分索引）
    Timestamp,
}

impl FromStr for VarKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(VarKind::None),
            "number" => Ok(VarKind::Number),
            "timestamp" => Ok(VarKind::Timestamp),
            other => Err(Error::InvalidVar(other.to_string())),
        }
    }
}

/// 解析后的变量值
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarValue {
    None,
    Number(i64),
    Timestamp(SystemTime),
}

impl VarKind {
    /// 按声明的语义解析变量值；解析失败返回 None（由调用方换下一个模板重试）
    pub fn parse(self, value: &str) -> Option<VarValue> {
        match self {
            VarKind::None => Some(VarValue::None),
            VarKind::Number => value.parse::<i64>().ok().map(VarValue::Number),
            VarKind::Timestamp => {
                let ms = value.parse::<u64>().ok()?;
                Some(VarValue::Timestamp(UNIX_EPOCH + Duration::from_millis(ms)))
            }
        }
    }
}

/// 一次匹配的结果：key 与 var 按模板中出现的顺序排列
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternMatch<'a> {
    pub keys: Vec<&'a str>,
    /// 与 `Pattern::var_kinds` 一一对应
    pub vars: Vec<&'a str>,
}

/// 命名模板，例如 `spot-<metric>-<namespace>-r-{number}`。
///
/// 启动时由配置构建，之后不可变。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    text: String,
    segments: Vec<Segment>,
    key_num: usize,
    var_num: usize,
}

impl Pattern {
    pub fn build(text: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPattern {
            pattern: text.to_string(),
            reason: reason.to_string(),
        };

        let mut segments: Vec<Segment> = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            let close = match c {
                '<' => '>',
                '{' => '}',
                _ => {
                    literal.push(c);
                    continue;
                }
            };

            let mut name = String::new();
            let mut terminated = false;
            for n in chars.by_ref() {
                if n == close {
                    terminated = true;
                    break;
                }
                if matches!(n, '<' | '{' | '>' | '}') {
                    return Err(invalid("nested delimiter"));
                }
                name.push(n);
            }
            if !terminated {
                return Err(invalid("unterminated delimiter"));
            }
            if name.is_empty() {
                return Err(invalid("empty segment name"));
            }

            if !literal.is_empty() {
                segments.push(Segment::Static(std::mem::take(&mut literal)));
            } else if segments.last().is_some_and(|s| !s.is_static()) {
                // 两个非静态段相邻时边界无法确定
                return Err(invalid("adjacent key/var segments"));
            }
            segments.push(if close == '>' {
                Segment::Key(name)
            } else {
                Segment::Var(name)
            });
        }
        if !literal.is_empty() {
            segments.push(Segment::Static(literal));
        }

        let key_num = segments
            .iter()
            .filter(|s| matches!(s, Segment::Key(_)))
            .count();
        let var_num = segments
            .iter()
            .filter(|s| matches!(s, Segment::Var(_)))
            .count();
        Ok(Self {
            text: text.to_string(),
            segments,
            key_num,
            var_num,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn key_num(&self) -> usize {
        self.key_num
    }

    pub fn var_num(&self) -> usize {
        self.var_num
    }

    /// 模板中所有 var 的语义（按出现顺序）
    pub fn var_kinds(&self) -> Result<Vec<VarKind>> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Var(name) => Some(name.parse::<VarKind>()),
                _ => None,
            })
            .collect()
    }

    pub fn check_vars(&self) -> Result<()> {
        self.var_kinds().map(|_| ())
    }

    /// 贪婪的从左到右匹配。
    ///
    /// 非静态段若后接静态段，则吃到该静态文本下一次出现处；位于末尾的非静态段吃掉剩余全部。
    /// 捕获值为空或包含 `invalid_chars` 中任一字符时失败（防止 `-`/`.` 之类分隔符造成跨分区串扰）。
    pub fn match_text<'a>(&self, text: &'a str, invalid_chars: &str) -> Option<PatternMatch<'a>> {
        let mut keys = Vec::with_capacity(self.key_num);
        let mut vars = Vec::with_capacity(self.var_num);
        let mut pos = 0usize;

        for (i, seg) in self.segments.iter().enumerate() {
            let rest = &text[pos..];
            match seg {
                Segment::Static(s) => {
                    if !rest.starts_with(s.as_str()) {
                        return None;
                    }
                    pos += s.len();
                }
                Segment::Key(_) | Segment::Var(_) => {
                    let end = match self.segments.get(i + 1) {
                        Some(Segment::Static(sep)) => rest.find(sep.as_str())?,
                        _ => rest.len(),
                    };
                    let value = &rest[..end];
                    if value.is_empty() || value.chars().any(|c| invalid_chars.contains(c)) {
                        return None;
                    }
                    if let Segment::Var(_) = seg {
                        vars.push(value);
                    } else {
                        keys.push(value);
                    }
                    pos += end;
                }
            }
        }

        (pos == text.len()).then_some(PatternMatch { keys, vars })
    }

    /// 仅适用于无 var 的模板（例如 alias 名）
    pub fn fill<S: AsRef<str>>(&self, keys: &[S]) -> Result<String> {
        if keys.len() != self.key_num {
            return Err(Error::KeyLength {
                expected: self.key_num,
                got: keys.len(),
            });
        }
        if self.var_num > 0 {
            return Err(Error::VarLength(self.text.clone()));
        }

        let mut out = String::with_capacity(self.text.len());
        let mut keys = keys.iter();
        for seg in &self.segments {
            match seg {
                Segment::Static(s) => out.push_str(s),
                Segment::Key(_) => {
                    if let Some(k) = keys.next() {
                        out.push_str(k.as_ref());
                    }
                }
                Segment::Var(_) => {}
            }
        }
        Ok(out)
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pattern::build(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn build_splits_segments() {
        let p = Pattern::build("spot-<metric>-<namespace>-r-{number}").unwrap();
        assert_eq!(
            p.segments(),
            &[
                Segment::Static("spot-".into()),
                Segment::Key("metric".into()),
                Segment::Static("-".into()),
                Segment::Key("namespace".into()),
                Segment::Static("-r-".into()),
                Segment::Var("number".into()),
            ]
        );
        assert_eq!(p.key_num(), 2);
        assert_eq!(p.var_num(), 1);
        assert!(p.check_vars().is_ok());
    }

    #[test]
    fn build_rejects_ambiguous_or_broken_patterns() {
        for bad in [
            "spot-<metric><namespace>",
            "spot-<metric>{number}",
            "spot-{timestamp}<metric>",
            "spot-<metric",
            "spot-{number",
            "spot-<>",
            "spot-<a{b}>",
        ] {
            assert!(
                matches!(Pattern::build(bad), Err(Error::InvalidPattern { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn check_vars_rejects_unknown_kind() {
        let p = Pattern::build("spot-<metric>-{day}").unwrap();
        assert_eq!(p.check_vars(), Err(Error::InvalidVar("day".into())));
    }

    #[test]
    fn match_is_greedy_up_to_next_separator() {
        let p = Pattern::build("spot-<metric>-<namespace>-r-{number}").unwrap();
        let m = p.match_text("spot-cpu-default-r-000003", "-.").unwrap();
        assert_eq!(m.keys, vec!["cpu", "default"]);
        assert_eq!(m.vars, vec!["000003"]);
    }

    #[test]
    fn match_rejects_invalid_chars_so_next_pattern_can_win() {
        let plain = Pattern::build("spot-<metric>-<namespace>-r-{number}").unwrap();
        let keyed = Pattern::build("spot-<metric>-<namespace>.<key>-r-{number}").unwrap();
        let name = "spot-cpu-default.host1-r-000001";
        assert!(plain.match_text(name, "-.").is_none());
        let m = keyed.match_text(name, "-.").unwrap();
        assert_eq!(m.keys, vec!["cpu", "default", "host1"]);
    }

    #[test]
    fn match_fails_on_literal_mismatch_and_trailing_text() {
        let p = Pattern::build("spot-<metric>-<namespace>").unwrap();
        assert!(p.match_text("span-cpu-default", "-.").is_none());
        assert!(p.match_text("spot-cpu", "-.").is_none());

        let fixed = Pattern::build("spot-<metric>-rollover").unwrap();
        assert!(fixed.match_text("spot-cpu-rollover-x", "").is_none());
        assert!(fixed.match_text("spot--rollover", "").is_none());
    }

    #[test]
    fn fill_error_selection() {
        let alias = Pattern::build("spot-<metric>-<namespace>-rollover").unwrap();
        assert_eq!(
            alias.fill(&["cpu", "default"]).unwrap(),
            "spot-cpu-default-rollover"
        );
        assert_eq!(
            alias.fill(&["cpu"]),
            Err(Error::KeyLength {
                expected: 2,
                got: 1
            })
        );

        let index = Pattern::build("spot-<metric>-r-{number}").unwrap();
        assert!(matches!(index.fill(&["cpu"]), Err(Error::VarLength(_))));
        assert!(matches!(
            index.fill::<&str>(&[]),
            Err(Error::KeyLength { .. })
        ));
    }

    #[test]
    fn var_kinds_parse_values() {
        assert_eq!(VarKind::Number.parse("000012"), Some(VarValue::Number(12)));
        assert_eq!(VarKind::Number.parse("x1"), None);
        assert_eq!(
            VarKind::Timestamp.parse("86400000"),
            Some(VarValue::Timestamp(UNIX_EPOCH + Duration::from_secs(86400)))
        );
        assert_eq!(VarKind::None.parse("anything"), Some(VarValue::None));
    }

    proptest! {
        #[test]
        fn var_free_fill_then_match_round_trips(
            metric in "[a-z0-9_]{1,12}",
            ns in "[a-z0-9_]{1,12}",
        ) {
            let p = Pattern::build("spot-<metric>-<namespace>-fixed").unwrap();
            let text = p.fill(&[metric.as_str(), ns.as_str()]).unwrap();
            let m = p.match_text(&text, "-.").unwrap();
            prop_assert_eq!(p.fill(&m.keys).unwrap(), text);
        }
    }
}
