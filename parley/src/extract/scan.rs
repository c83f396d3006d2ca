//! Partial scanner for the answer grammar.
//!
//! The grammar is a sequence of `"key": value` entries where a value is a
//! JSON-escaped string or a bracketed list of values. Commas and whitespace
//! separate tokens; `//` starts a comment running to the end of the line.
//!
//! The scanner accepts any prefix of a valid document. Strings and lists that
//! are still open at the end of input are reported with `closed == false`, and
//! the first token that cannot belong to the grammar stops the scan with
//! `malformed` set. Nothing before that point is discarded.

/// A scanned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Str { text: String, closed: bool },
    List { items: Vec<Self>, closed: bool },
}

impl Value {
    /// Returns the string content of a closed string.
    pub(crate) fn closed_str(&self) -> Option<&str> {
        match self {
            Self::Str { text, closed: true } => Some(text),
            _ => None,
        }
    }

    /// Returns the items of a closed list.
    pub(crate) fn closed_items(&self) -> Option<&[Self]> {
        match self {
            Self::List {
                items,
                closed: true,
            } => Some(items),
            _ => None,
        }
    }
}

/// A `"key": value` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) key: String,
    pub(crate) value: Value,
}

/// Result of scanning a document prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Scan {
    pub(crate) entries: Vec<Entry>,
    pub(crate) malformed: bool,
}

/// Why scanning stopped before the end of a construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Input ended; more text may complete the construct.
    Eof,
    /// A character that cannot appear here.
    Malformed,
}

type Step<T> = Result<T, Stop>;

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    malformed: bool,
}

impl<'a> Scanner<'a> {
    const fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            malformed: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn fail<T>(&mut self) -> Step<T> {
        self.malformed = true;
        Err(Stop::Malformed)
    }

    /// Skips whitespace, commas and `//` comments.
    fn skip_trivia(&mut self) -> Step<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == ',' => {
                    self.bump();
                }
                Some('/') => {
                    let rest = &self.text[self.pos..];
                    if rest.len() == 1 {
                        return Err(Stop::Eof);
                    }
                    if !rest.starts_with("//") {
                        return self.fail();
                    }
                    match rest.find('\n') {
                        Some(nl) => self.pos += nl + 1,
                        None => {
                            self.pos = self.text.len();
                            return Ok(());
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scans a string whose opening quote has not been consumed yet.
    ///
    /// Returns the decoded text and whether the closing quote was seen.
    fn string(&mut self) -> (String, bool) {
        self.bump();
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return (out, false);
            };
            match c {
                '"' => return (out, true),
                '\\' => match self.escape() {
                    Some(decoded) => out.push(decoded),
                    None => return (out, false),
                },
                _ => out.push(c),
            }
        }
    }

    /// Decodes the escape after a backslash; `None` if input ends inside it.
    fn escape(&mut self) -> Option<char> {
        let c = self.bump()?;
        let decoded = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'u' => {
                let rest = &self.text[self.pos..];
                if rest.len() < 4 && rest.chars().all(|h| h.is_ascii_hexdigit()) {
                    return None;
                }
                match rest
                    .get(..4)
                    .filter(|hex| hex.chars().all(|h| h.is_ascii_hexdigit()))
                {
                    Some(hex) => {
                        self.pos += 4;
                        u32::from_str_radix(hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .unwrap_or('\u{fffd}')
                    }
                    None => '\u{fffd}',
                }
            }
            other => other,
        };
        Some(decoded)
    }

    fn value(&mut self) -> Step<Value> {
        match self.peek() {
            None => Err(Stop::Eof),
            Some('"') => {
                let (text, closed) = self.string();
                Ok(Value::Str { text, closed })
            }
            Some('[') => {
                self.bump();
                Ok(self.list())
            }
            Some(_) => self.fail(),
        }
    }

    /// Scans list items after the opening bracket.
    fn list(&mut self) -> Value {
        let mut items = Vec::new();
        loop {
            if self.skip_trivia().is_err() || self.peek().is_none() {
                break;
            }
            if self.peek() == Some(']') {
                self.bump();
                return Value::List {
                    items,
                    closed: true,
                };
            }
            let Ok(item) = self.value() else {
                break;
            };
            let open = !is_closed(&item);
            items.push(item);
            if open {
                break;
            }
        }
        Value::List {
            items,
            closed: false,
        }
    }

    fn entry(&mut self) -> Step<Entry> {
        if self.peek() != Some('"') {
            return self.fail();
        }
        let (key, closed) = self.string();
        if !closed {
            return Err(Stop::Eof);
        }
        self.skip_inline_space();
        match self.bump() {
            Some(':') => {}
            Some(_) => return self.fail(),
            None => return Err(Stop::Eof),
        }
        self.skip_inline_space();
        let value = self.value()?;
        Ok(Entry { key, value })
    }

    fn skip_inline_space(&mut self) {
        while self.peek().is_some_and(|c| c == ' ' || c == '\t') {
            self.bump();
        }
    }
}

fn is_closed(value: &Value) -> bool {
    match value {
        Value::Str { closed, .. } | Value::List { closed, .. } => *closed,
    }
}

/// Scans `text` into entries.
pub(crate) fn scan(text: &str) -> Scan {
    let mut scanner = Scanner::new(text);
    let mut entries = Vec::new();
    loop {
        if scanner.skip_trivia().is_err() || scanner.peek().is_none() {
            break;
        }
        let Ok(entry) = scanner.entry() else {
            break;
        };
        let open = !is_closed(&entry.value);
        entries.push(entry);
        if open {
            break;
        }
    }
    Scan {
        entries,
        malformed: scanner.malformed,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn s(text: &str, closed: bool) -> Value {
        Value::Str {
            text: text.into(),
            closed,
        }
    }

    #[test]
    fn scans_closed_entries() {
        let out = scan("\"answer\": \"hi\"\n\"examples\": [\"a\", \"b\"]\n");
        assert!(!out.malformed);
        assert_eq!(out.entries.len(), 2);
        assert_eq!(out.entries[0].value, s("hi", true));
        assert_eq!(
            out.entries[1].value,
            Value::List {
                items: vec![s("a", true), s("b", true)],
                closed: true
            }
        );
    }

    #[test]
    fn open_string_at_eof() {
        let out = scan("\"answer\": \"partial te");
        assert!(!out.malformed);
        assert_eq!(out.entries[0].value, s("partial te", false));
    }

    #[test]
    fn dangling_escape_is_dropped() {
        let out = scan("\"answer\": \"a\\");
        assert_eq!(out.entries[0].value, s("a", false));
        let out = scan("\"answer\": \"a\\u00");
        assert_eq!(out.entries[0].value, s("a", false));
    }

    #[test]
    fn decodes_escapes() {
        let out = scan(r#""answer": "q\"x\"\né\\""#);
        assert_eq!(out.entries[0].value, s("q\"x\"\né\\", true));
    }

    #[test]
    fn comments_are_skipped() {
        let out = scan("// [question]: \"x\"\n\"answer\": \"y\"\n// [end-q");
        assert!(!out.malformed);
        assert_eq!(out.entries.len(), 1);
    }

    #[test]
    fn lone_slash_at_eof_is_pending() {
        let out = scan("\"answer\": \"y\"\n/");
        assert!(!out.malformed);
        let out = scan("\"answer\": \"y\"\n/x");
        assert!(out.malformed);
        assert_eq!(out.entries.len(), 1);
    }

    #[test]
    fn incomplete_key_yields_nothing() {
        assert!(scan("\"answ").entries.is_empty());
        assert!(scan("\"answer\"").entries.is_empty());
        assert!(scan("\"answer\": ").entries.is_empty());
    }

    #[test]
    fn prose_is_malformed() {
        let out = scan("Sure! Here is the answer.");
        assert!(out.malformed);
        assert!(out.entries.is_empty());
    }

    #[test]
    fn malformed_list_item_keeps_earlier_items() {
        let out = scan("\"examples\": [\"a\", oops]");
        assert!(out.malformed);
        assert_eq!(
            out.entries[0].value,
            Value::List {
                items: vec![s("a", true)],
                closed: false
            }
        );
    }

    #[test]
    fn nested_lists_stay_open_at_eof() {
        let out = scan("\"code\": [[\"int x;\", \"decl");
        assert!(!out.malformed);
        let Value::List { items, closed } = &out.entries[0].value else {
            panic!("expected list");
        };
        assert!(!closed);
        assert_eq!(
            items[0],
            Value::List {
                items: vec![s("int x;", true), s("decl", false)],
                closed: false
            }
        );
    }
}
