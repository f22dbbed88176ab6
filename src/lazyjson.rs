//! Streaming, non-owning walk over a JSON document.
//!
//! The scanner keeps a stack of frames describing the object or array the
//! caller is currently positioned in; cursors are byte offsets into the
//! caller-owned document. Nothing is parsed ahead of time and the document
//! is never mutated, so walking a large payload to pull out two attributes
//! costs a linear scan and no tree allocation.
//!
//! All walkers track quoted and escaped state byte by byte: braces and
//! brackets only count as structure outside strings, and a backslash
//! escapes exactly one character.

/// Cursor into the scanned document, as a byte offset.
pub type Cursor = usize;

struct Frame {
    in_object: bool,
    in_array: bool,
    start: usize,
    end: usize,
}

/// Depth-tracking scanner over a JSON document borrowed from the caller.
pub struct LazyJson<'a> {
    doc: &'a [u8],
    frames: Vec<Frame>,
    raw_buf: Vec<u8>,
}

impl<'a> LazyJson<'a> {
    /// Begin scanning a document. The initial frame covers the top-level
    /// object or array, if the document starts with one.
    pub fn new(doc: &'a str) -> Self {
        let bytes = doc.as_bytes();
        let mut start = 0;
        while start < bytes.len() && bytes[start].is_ascii_whitespace() {
            start += 1;
        }
        let in_object = bytes.get(start) == Some(&b'{');
        let in_array = bytes.get(start) == Some(&b'[');
        let end = if in_object || in_array {
            scan_matching_close(bytes, start).unwrap_or(bytes.len())
        } else {
            bytes.len()
        };
        Self {
            doc: bytes,
            frames: vec![Frame {
                in_object,
                in_array,
                start,
                end,
            }],
            raw_buf: Vec::new(),
        }
    }

    /// Find the value cursor for a key in the current object frame.
    ///
    /// Only direct members of the frame are matched: keys inside nested
    /// objects or arrays, and strings that happen to appear in values, are
    /// skipped. Returns `None` when the key is absent or the current frame
    /// is not an object.
    pub fn attribute(&self, name: &str) -> Option<Cursor> {
        let frame = self.frames.last()?;
        if !frame.in_object {
            return None;
        }
        let doc = self.doc;
        let mut i = frame.start + 1;
        let mut depth = 0usize;
        while i < frame.end {
            let c = doc[i];
            match c {
                b'"' if depth == 0 => {
                    let close = scan_string_close(doc, i)?;
                    let key = &doc[i + 1..close];
                    let mut j = close + 1;
                    while j < frame.end && doc[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if doc.get(j) == Some(&b':') {
                        if key == name.as_bytes() {
                            j += 1;
                            while j < frame.end && doc[j].is_ascii_whitespace() {
                                j += 1;
                            }
                            return Some(j);
                        }
                        i = j + 1;
                    } else {
                        i = close + 1;
                    }
                }
                b'"' => {
                    i = scan_string_close(doc, i)? + 1;
                }
                b'{' | b'[' => {
                    depth += 1;
                    i += 1;
                }
                b'}' | b']' => {
                    depth = depth.saturating_sub(1);
                    i += 1;
                }
                _ => i += 1,
            }
        }
        None
    }

    pub fn is_null(&self, cursor: Cursor) -> bool {
        self.has_prefix_ci(cursor, b"null")
    }

    pub fn is_true(&self, cursor: Cursor) -> bool {
        self.has_prefix_ci(cursor, b"true")
    }

    pub fn is_false(&self, cursor: Cursor) -> bool {
        self.has_prefix_ci(cursor, b"false")
    }

    pub fn is_bool(&self, cursor: Cursor) -> bool {
        self.is_true(cursor) || self.is_false(cursor)
    }

    fn has_prefix_ci(&self, cursor: Cursor, word: &[u8]) -> bool {
        self.doc
            .get(cursor..cursor + word.len())
            .map(|s| s.eq_ignore_ascii_case(word))
            .unwrap_or(false)
    }

    /// Enter the array at the cursor, pushing a new frame. Returns the
    /// cursor of the first element (which is the closing bracket for an
    /// empty array), or `None` if the cursor is not at `[`.
    pub fn enter_array(&mut self, cursor: Cursor) -> Option<Cursor> {
        if self.doc.get(cursor) != Some(&b'[') {
            return None;
        }
        let mut first = cursor + 1;
        while first < self.doc.len() && self.doc[first].is_ascii_whitespace() {
            first += 1;
        }
        if first >= self.doc.len() {
            return None;
        }
        let end = scan_matching_close(self.doc, cursor).unwrap_or(self.doc.len());
        self.frames.push(Frame {
            in_object: false,
            in_array: true,
            start: cursor,
            end,
        });
        Some(first)
    }

    /// Enter the object at the cursor, pushing a new frame. The cursor is
    /// returned unchanged.
    pub fn enter_object(&mut self, cursor: Cursor) -> Option<Cursor> {
        if self.doc.get(cursor) != Some(&b'{') {
            return None;
        }
        let end = scan_matching_close(self.doc, cursor).unwrap_or(self.doc.len());
        self.frames.push(Frame {
            in_object: true,
            in_array: false,
            start: cursor,
            end,
        });
        Some(cursor)
    }

    /// Advance to the next element of the current array, skipping balanced
    /// braces, brackets and quoted strings. Returns `None` at `]`.
    pub fn next_array_element(&self, cursor: Cursor) -> Option<Cursor> {
        let doc = self.doc;
        let mut nested = 0usize;
        let mut object = 0usize;
        let mut quoted = false;
        let mut escaped = false;
        let mut i = cursor;
        while i < doc.len() {
            let c = doc[i];
            if escaped {
                escaped = false;
            } else if c == b'"' {
                quoted = !quoted;
            } else if quoted {
                if c == b'\\' {
                    escaped = true;
                }
            } else if c == b'{' {
                object += 1;
            } else if c == b'}' {
                object = object.saturating_sub(1);
            } else if c == b'[' {
                nested += 1;
            } else if c == b']' {
                if nested > 0 {
                    nested -= 1;
                } else {
                    return None; // End of the array
                }
            } else if c == b',' && nested == 0 && object == 0 {
                let mut j = i + 1;
                while j < doc.len() && doc[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < doc.len() {
                    return Some(j);
                }
                return None;
            }
            i += 1;
        }
        None
    }

    /// Count the remaining elements of the array without consuming state.
    /// Returns -1 and logs on an unterminated array or a trailing comma.
    pub fn array_size(&self, cursor: Cursor) -> i64 {
        let doc = self.doc;
        if doc.get(cursor) == Some(&b']') {
            return 0;
        }
        let mut nested = 0usize;
        let mut object = 0usize;
        let mut quoted = false;
        let mut escaped = false;
        let mut size = 1i64;
        let mut i = cursor;
        while i < doc.len() {
            let c = doc[i];
            if escaped {
                escaped = false;
            } else if c == b'"' {
                quoted = !quoted;
            } else if quoted {
                if c == b'\\' {
                    escaped = true;
                }
            } else if c == b'{' {
                object += 1;
            } else if c == b'}' {
                object = object.saturating_sub(1);
            } else if c == b'[' {
                nested += 1;
            } else if c == b']' {
                if nested > 0 {
                    nested -= 1;
                } else {
                    return size;
                }
            } else if c == b',' && nested == 0 && object == 0 {
                let mut j = i + 1;
                while j < doc.len() && doc[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j >= doc.len() || doc[j] == b']' {
                    tracing::error!(
                        "Unterminated array in JSON document, document has trailing ','"
                    );
                    return -1;
                }
                size += 1;
                i = j;
                continue;
            }
            i += 1;
        }
        tracing::error!("Unterminated array in JSON document");
        -1
    }

    /// Materialise the raw bytes of the object or array at the cursor.
    ///
    /// `\x` sequences are unescaped to `x`. The returned slice borrows the
    /// scanner's internal buffer, which is reused by the next call; copy it
    /// out if it must outlive further scanning.
    pub fn raw_object(&mut self, cursor: Cursor) -> Option<&str> {
        self.copy_raw(cursor, None)
    }

    /// As [`raw_object`](Self::raw_object), additionally inserting `\`
    /// before every occurrence of `esc` in the output.
    pub fn raw_object_escaped(&mut self, cursor: Cursor, esc: char) -> Option<&str> {
        self.copy_raw(cursor, Some(esc as u8))
    }

    fn copy_raw(&mut self, cursor: Cursor, esc: Option<u8>) -> Option<&str> {
        let end = scan_matching_close(self.doc, cursor)?;
        self.raw_buf.clear();
        let mut escaped = false;
        for &c in &self.doc[cursor..=end] {
            if c == b'\\' && !escaped {
                escaped = true;
                continue;
            }
            if Some(c) == esc {
                self.raw_buf.push(b'\\');
            }
            self.raw_buf.push(c);
            escaped = false;
        }
        std::str::from_utf8(&self.raw_buf).ok()
    }

    /// Copy the string value at the cursor out with unescaping, returning
    /// an owned string.
    pub fn string(&self, cursor: Cursor) -> Option<String> {
        let mut out = String::new();
        if self.string_into(cursor, &mut out) {
            Some(out)
        } else {
            None
        }
    }

    /// Copy the string value at the cursor into a caller-provided buffer.
    /// The buffer is cleared first. Returns false on an unterminated string.
    pub fn string_into(&self, cursor: Cursor, buffer: &mut String) -> bool {
        let doc = self.doc;
        let start = if doc.get(cursor) == Some(&b'"') {
            cursor + 1
        } else {
            cursor
        };
        // Scan for the closing quote from inside the string
        let mut close = start;
        let mut escaped = false;
        loop {
            match doc.get(close) {
                Some(b'"') if !escaped => break,
                Some(b'\\') if !escaped => escaped = true,
                Some(_) => escaped = false,
                None => return false,
            }
            close += 1;
        }
        buffer.clear();
        // The document is valid UTF-8 and only ASCII bytes are dropped, so
        // the unescaped copy is valid too
        let content = match std::str::from_utf8(&doc[start..close]) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let mut escaped = false;
        for ch in content.chars() {
            if ch == '\\' && !escaped {
                escaped = true;
                continue;
            }
            buffer.push(ch);
            escaped = false;
        }
        true
    }

    /// Parse the decimal integer at the cursor, with optional leading `-`.
    pub fn int_value(&self, cursor: Cursor) -> i64 {
        let doc = self.doc;
        let mut i = cursor;
        let mut sign = 1i64;
        if doc.get(i) == Some(&b'-') {
            sign = -1;
            i += 1;
        }
        let mut value = 0i64;
        while let Some(&c) = doc.get(i) {
            if !c.is_ascii_digit() {
                break;
            }
            value = value * 10 + (c - b'0') as i64;
            i += 1;
        }
        value * sign
    }

    /// Whether the current frame is an array.
    pub fn in_array(&self) -> bool {
        self.frames.last().map_or(false, |f| f.in_array)
    }

    /// Discard the top frame.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Locate the matching close of the object or array at the cursor.
    pub fn object_end(&self, cursor: Cursor) -> Option<Cursor> {
        scan_matching_close(self.doc, cursor)
    }
}

/// Offset of the closing quote of the string opening at `open`.
fn scan_string_close(doc: &[u8], open: usize) -> Option<usize> {
    let mut i = open.checked_add(1)?;
    let mut escaped = false;
    while i < doc.len() {
        match doc[i] {
            b'"' if !escaped => return Some(i),
            b'\\' if !escaped => escaped = true,
            _ => escaped = false,
        }
        i += 1;
    }
    None
}

/// Offset of the bracket closing the object or array opening at `start`.
fn scan_matching_close(doc: &[u8], start: usize) -> Option<usize> {
    let (open, close) = match doc.get(start) {
        Some(b'{') => (b'{', b'}'),
        Some(b'[') => (b'[', b']'),
        _ => return None,
    };
    let mut nested = 0usize;
    let mut quoted = false;
    let mut escaped = false;
    let mut i = start;
    while i < doc.len() {
        let c = doc[i];
        if escaped {
            escaped = false;
        } else if c == b'"' {
            quoted = !quoted;
        } else if quoted {
            if c == b'\\' {
                escaped = true;
            }
        } else if c == open {
            nested += 1;
        } else if c == close {
            nested -= 1;
            if nested == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{ "asset": "pump1", "count": -12, "flag": true,
        "nested": { "inner": "v{a}l" },
        "items": [ 1, {"a": [2, 3]}, "x, y" ],
        "note": "a \"quoted\" word" }"#;

    #[test]
    fn test_attribute_finds_direct_members() {
        let doc = LazyJson::new(DOC);
        let c = doc.attribute("asset").unwrap();
        assert_eq!(doc.string(c), Some("pump1".to_string()));
        assert!(doc.attribute("missing").is_none());
    }

    #[test]
    fn test_attribute_ignores_nested_keys_and_values() {
        let doc = LazyJson::new(DOC);
        // "inner" is a member of the nested object, not of the root
        assert!(doc.attribute("inner").is_none());
        // "pump1" is a value, not a key
        assert!(doc.attribute("pump1").is_none());
    }

    #[test]
    fn test_attribute_does_not_match_key_prefix() {
        let doc = LazyJson::new(r#"{"reading": 1, "readings": 2}"#);
        let c = doc.attribute("readings").unwrap();
        assert_eq!(doc.int_value(c), 2);
        let c = doc.attribute("reading").unwrap();
        assert_eq!(doc.int_value(c), 1);
    }

    #[test]
    fn test_attribute_outside_object_frame() {
        let mut doc = LazyJson::new(DOC);
        let items = doc.attribute("items").unwrap();
        doc.enter_array(items).unwrap();
        assert!(doc.attribute("asset").is_none());
        doc.pop();
        assert!(doc.attribute("asset").is_some());
    }

    #[test]
    fn test_value_class_checks() {
        let doc = LazyJson::new(r#"{"a": null, "b": TRUE, "c": false, "d": 1}"#);
        assert!(doc.is_null(doc.attribute("a").unwrap()));
        assert!(doc.is_true(doc.attribute("b").unwrap()));
        assert!(doc.is_bool(doc.attribute("b").unwrap()));
        assert!(doc.is_false(doc.attribute("c").unwrap()));
        assert!(!doc.is_bool(doc.attribute("d").unwrap()));
    }

    #[test]
    fn test_array_walk_skips_nested_structure() {
        let mut doc = LazyJson::new(DOC);
        let items = doc.attribute("items").unwrap();
        let first = doc.enter_array(items).unwrap();
        assert_eq!(doc.int_value(first), 1);
        let second = doc.next_array_element(first).unwrap();
        assert_eq!(&DOC[second..second + 1], "{");
        let third = doc.next_array_element(second).unwrap();
        assert_eq!(doc.string(third), Some("x, y".to_string()));
        assert!(doc.next_array_element(third).is_none());
    }

    #[test]
    fn test_array_size() {
        let mut doc = LazyJson::new(DOC);
        let items = doc.attribute("items").unwrap();
        let first = doc.enter_array(items).unwrap();
        assert_eq!(doc.array_size(first), 3);
        // Counting does not consume state
        assert_eq!(doc.array_size(first), 3);
    }

    #[test]
    fn test_array_size_empty_and_unterminated() {
        let mut doc = LazyJson::new(r#"{"e": []}"#);
        let e = doc.attribute("e").unwrap();
        let first = doc.enter_array(e).unwrap();
        assert_eq!(doc.array_size(first), 0);

        let bad = LazyJson::new("[1, 2");
        assert_eq!(bad.array_size(1), -1);
    }

    #[test]
    fn test_array_size_trailing_comma() {
        let doc = LazyJson::new("[1, 2, ]");
        assert_eq!(doc.array_size(1), -1);
    }

    #[test]
    fn test_raw_object_unescapes() {
        let mut doc = LazyJson::new(r#"{"o": {"k": "a\"b"}}"#);
        let o = doc.attribute("o").unwrap();
        assert_eq!(doc.raw_object(o), Some(r#"{"k": "a"b"}"#));
    }

    #[test]
    fn test_raw_object_escaped_variant() {
        let mut doc = LazyJson::new(r#"{"o": {"k": 1}}"#);
        let o = doc.attribute("o").unwrap();
        assert_eq!(doc.raw_object_escaped(o, '"'), Some(r#"{\"k\": 1}"#));
    }

    #[test]
    fn test_string_unescapes() {
        let doc = LazyJson::new(DOC);
        let c = doc.attribute("note").unwrap();
        assert_eq!(doc.string(c), Some("a \"quoted\" word".to_string()));

        let mut buf = String::from("previous contents");
        assert!(doc.string_into(c, &mut buf));
        assert_eq!(buf, "a \"quoted\" word");
    }

    #[test]
    fn test_int_value_negative() {
        let doc = LazyJson::new(DOC);
        let c = doc.attribute("count").unwrap();
        assert_eq!(doc.int_value(c), -12);
    }

    #[test]
    fn test_object_end_matches_brackets() {
        let text = r#"{"a": [1, "]"], "b": 2}"#;
        let doc = LazyJson::new(text);
        assert_eq!(doc.object_end(0), Some(text.len() - 1));
        // The ']' inside the quoted string is not structure
        let a = doc.attribute("a").unwrap();
        assert_eq!(&text[doc.object_end(a).unwrap()..], r#"], "b": 2}"#);
    }
}
